use std::fmt::{self, Display};
use std::io::{self, Write};
use std::iter;
use std::str::FromStr;

use itertools::Itertools;

use crate::{CpuSet, Error, ProcessorId};

const FIELD_WIDTH: usize = 12;

/// How [`ResultMatrix::render()`] lays out the measurements.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum Layout {
    /// One line per processor and repetition, led by the processor and repetition number.
    Long,

    /// One line per repetition with the columns of all processors side by side, headed
    /// `timestamp-c<P>` and `<counter>-c<P>`.
    #[default]
    Wide,
}

impl FromStr for Layout {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "long" => Ok(Self::Long),
            "wide" => Ok(Self::Wide),
            _ => Err(Error::Configuration(format!(
                "unknown layout '{s}', expected 'long' or 'wide'"
            ))),
        }
    }
}

impl Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Long => f.write_str("long"),
            Self::Wide => f.write_str("wide"),
        }
    }
}

/// Measurements of one benchmark run: for every processor, for every repetition, a timestamp
/// delta followed by one delta per counter.
///
/// The rows of the matrix are the processors of the run in their dense index order. Every row
/// is a contiguous slice of `repetitions × columns` values that one executor fills while the
/// run is in progress, after which the matrix is only read.
///
/// ```
/// use lockstep::{CpuSet, ResultMatrix};
///
/// let processors: CpuSet = [2, 7].into_iter().collect();
/// let mut matrix = ResultMatrix::new(processors, 3, ["cycles"]);
///
/// assert_eq!(matrix.buffer_for_processor(1).len(), 3 * 2);
/// assert_eq!(matrix.column_names(), ["timestamp-c2", "cycles-c2", "timestamp-c7", "cycles-c7"]);
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResultMatrix {
    processors: CpuSet,
    repetitions: usize,
    counters: Vec<String>,
    data: Vec<u64>,
}

impl ResultMatrix {
    /// Creates a zeroed matrix for the processors, with `repetitions` measurements of the
    /// named counters each.
    #[must_use]
    pub fn new<I, S>(processors: CpuSet, repetitions: usize, counters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let counters: Vec<String> = counters.into_iter().map(Into::into).collect();

        let len = processors
            .len()
            .checked_mul(repetitions)
            .and_then(|len| len.checked_mul(counters.len().wrapping_add(1)))
            .expect("result matrix size overflows usize");

        Self {
            processors,
            repetitions,
            counters,
            data: vec![0; len],
        }
    }

    /// The processors the rows belong to, in row order.
    #[must_use]
    pub fn processors(&self) -> &CpuSet {
        &self.processors
    }

    /// Number of rows, one per processor.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.processors.len()
    }

    /// Number of measurements per row.
    #[must_use]
    pub fn repetitions(&self) -> usize {
        self.repetitions
    }

    /// Number of values per measurement: the timestamp plus one per counter.
    #[must_use]
    pub fn columns(&self) -> usize {
        self.counters.len().wrapping_add(1)
    }

    /// Names of the counters, in column order after the timestamp.
    #[must_use]
    pub fn counter_names(&self) -> &[String] {
        &self.counters
    }

    /// Whether the matrix holds no measurements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// All values, row after row.
    #[must_use]
    pub fn as_slice(&self) -> &[u64] {
        &self.data
    }

    /// The writable row of the processor with the given dense index.
    ///
    /// # Panics
    ///
    /// Panics if the index is not below [`rows()`][Self::rows].
    pub fn buffer_for_processor(&mut self, index: usize) -> &mut [u64] {
        assert!(
            index < self.rows(),
            "processor index {index} out of range for {} rows",
            self.rows()
        );

        self.rows_mut()
            .nth(index)
            .expect("every index below the row count has a row")
    }

    /// Every writable row, in row order. The rows never overlap.
    pub fn rows_mut(&mut self) -> impl Iterator<Item = &mut [u64]> {
        let rows = self.rows();
        let row_len = self.row_len();

        // Without repetitions every row is empty and the data has no chunks to yield.
        self.data
            .chunks_mut(row_len.max(1))
            .chain(iter::repeat_with(<&mut [u64]>::default))
            .take(rows)
    }

    /// The row of the processor with the given dense index.
    #[must_use]
    pub fn row(&self, index: usize) -> Option<&[u64]> {
        if index >= self.rows() {
            return None;
        }

        let row_len = self.row_len();
        let start = index.checked_mul(row_len)?;

        self.data.get(start..start.checked_add(row_len)?)
    }

    /// The value of one column of one measurement.
    #[must_use]
    pub fn value(&self, row: usize, repetition: usize, column: usize) -> Option<u64> {
        if repetition >= self.repetitions || column >= self.columns() {
            return None;
        }

        let offset = repetition
            .checked_mul(self.columns())?
            .checked_add(column)?;

        self.row(row)?.get(offset).copied()
    }

    /// The timestamp delta of one measurement.
    #[must_use]
    pub fn timestamp(&self, row: usize, repetition: usize) -> Option<u64> {
        self.value(row, repetition, 0)
    }

    /// Column names of the wide layout: `timestamp-c<P>` then `<counter>-c<P>` for every
    /// processor `P`, in row order.
    #[must_use]
    pub fn column_names(&self) -> Vec<String> {
        self.processors
            .iter()
            .flat_map(|processor| self.columns_of(processor))
            .collect()
    }

    /// Writes the measurements under a `# <name>` header line.
    ///
    /// # Errors
    ///
    /// Returns the error of the writer.
    pub fn render(&self, name: &str, out: &mut dyn Write, layout: Layout) -> io::Result<()> {
        match layout {
            Layout::Long => self.render_long(name, out),
            Layout::Wide => self.render_wide(name, out),
        }
    }

    /// Writes one line per processor and repetition.
    ///
    /// # Errors
    ///
    /// Returns the error of the writer.
    pub fn render_long(&self, name: &str, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "# {name}")?;

        let header = ["cpu", "rep", "timestamp"]
            .into_iter()
            .chain(self.counters.iter().map(String::as_str))
            .map(|column| format!("{column:>FIELD_WIDTH$}"))
            .join(" ");
        writeln!(out, "{header}")?;

        for (index, processor) in self.processors.iter().enumerate() {
            for repetition in 0..self.repetitions {
                let line = [processor.to_string(), repetition.to_string()]
                    .into_iter()
                    .chain(self.measurement(index, repetition).map(|value| value.to_string()))
                    .map(|field| format!("{field:>FIELD_WIDTH$}"))
                    .join(" ");
                writeln!(out, "{line}")?;
            }
        }

        Ok(())
    }

    /// Writes one line per repetition with the measurements of all processors side by side.
    ///
    /// # Errors
    ///
    /// Returns the error of the writer.
    pub fn render_wide(&self, name: &str, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "# {name}")?;

        let header = self
            .column_names()
            .iter()
            .map(|column| format!("{column:>FIELD_WIDTH$}"))
            .join(" ");
        writeln!(out, "{header}")?;

        for repetition in 0..self.repetitions {
            let line = (0..self.rows())
                .flat_map(|index| self.measurement(index, repetition))
                .map(|value| format!("{value:>FIELD_WIDTH$}"))
                .join(" ");
            writeln!(out, "{line}")?;
        }

        Ok(())
    }

    fn row_len(&self) -> usize {
        self.repetitions.wrapping_mul(self.columns())
    }

    fn measurement(&self, row: usize, repetition: usize) -> impl Iterator<Item = u64> + '_ {
        (0..self.columns()).filter_map(move |column| self.value(row, repetition, column))
    }

    fn columns_of(&self, processor: ProcessorId) -> impl Iterator<Item = String> + '_ {
        iter::once(format!("timestamp-c{processor}")).chain(
            self.counters
                .iter()
                .map(move |counter| format!("{counter}-c{processor}")),
        )
    }
}
