use crate::{Error, Result};

/// Bits of `IA32_PERFEVTSELx` that describe the event rather than how it is counted: event
/// select (7:0), unit mask (15:8), edge detect (18), invert (23) and counter mask (31:24).
pub const EVENT_SELECT_MASK: u64 = 0xFF84_FFFF;

/// Pre-defined architectural events, as (names, event select, unit mask).
const ARCHITECTURAL_EVENTS: &[(&[&str], u8, u8)] = &[
    (&["cycles", "cpu-cycles", "unhalted_core_cycles"], 0x3C, 0x00),
    (&["instructions", "instructions_retired"], 0xC0, 0x00),
    (&["ref-cycles", "unhalted_reference_cycles"], 0x3C, 0x01),
    (&["cache-references", "llc_references"], 0x2E, 0x4F),
    (&["cache-misses", "llc_misses"], 0x2E, 0x41),
    (
        &["branches", "branch-instructions", "branch_instructions_retired"],
        0xC4,
        0x00,
    ),
    (
        &["branch-misses", "branch_misses_retired"],
        0xC5,
        0x00,
    ),
];

/// Resolves an x86 event name to the event-describing bits of an event-select register.
///
/// Accepts the architectural event names (`cycles`, `instructions`, `ref-cycles`,
/// `cache-references`, `cache-misses`, `branches`, `branch-misses`, case-insensitive), raw
/// encodings in perf syntax (`r01c2` for umask 0x01, event 0xc2) and the term syntax
/// `event=0xc2,umask=0x01[,cmask=N][,edge][,inv]`.
///
/// # Errors
///
/// Returns [`Error::UnknownEvent`] for unknown names and [`Error::InvalidEventSyntax`] for raw
/// encodings that do not parse or that set bits outside [`EVENT_SELECT_MASK`].
pub fn parse_x86_event(name: &str) -> Result<u64> {
    let normalized = name.trim().to_lowercase();

    if let Some((_, event, umask)) = ARCHITECTURAL_EVENTS
        .iter()
        .find(|(names, _, _)| names.contains(&normalized.as_str()))
    {
        return Ok(u64::from(*event) | (u64::from(*umask) << 8));
    }

    let select = if normalized.contains('=') {
        parse_terms(name, &normalized)?
    } else if let Some(hex) = normalized.strip_prefix('r') {
        if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::UnknownEvent {
                name: name.to_string(),
                backend: "x86",
            });
        }

        u64::from_str_radix(hex, 16).map_err(|e| invalid(name, e.to_string()))?
    } else {
        return Err(Error::UnknownEvent {
            name: name.to_string(),
            backend: "x86",
        });
    };

    if select & !EVENT_SELECT_MASK != 0 {
        return Err(invalid(
            name,
            format!("bits {:#x} control counting, not the event", select & !EVENT_SELECT_MASK),
        ));
    }

    Ok(select)
}

fn parse_terms(name: &str, normalized: &str) -> Result<u64> {
    let mut select = 0_u64;
    let mut has_event = false;

    for term in normalized.split(',').map(str::trim) {
        let (key, value) = term.split_once('=').unwrap_or((term, "1"));
        let value = parse_number(value).ok_or_else(|| invalid(name, format!("bad value in '{term}'")))?;

        let (shift, limit) = match key {
            "event" => {
                has_event = true;
                (0, 0xFF)
            }
            "umask" => (8, 0xFF),
            "edge" => (18, 1),
            "inv" => (23, 1),
            "cmask" => (24, 0xFF),
            _ => return Err(invalid(name, format!("unknown term '{key}'"))),
        };

        if value > limit {
            return Err(invalid(name, format!("'{key}' must not exceed {limit:#x}")));
        }

        select |= value << shift;
    }

    if !has_event {
        return Err(invalid(name, "the 'event' term is required".to_string()));
    }

    Ok(select)
}

fn parse_number(value: &str) -> Option<u64> {
    match value.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

fn invalid(name: &str, problem: String) -> Error {
    Error::InvalidEventSyntax {
        name: name.to_string(),
        problem,
    }
}
