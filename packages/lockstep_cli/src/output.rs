use std::fs::File;
use std::io::{self, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::{RunError, STDOUT};

/// Refuses a destination file that exists already, so that nothing is measured in vain.
///
/// [`open()`] refuses it again when the measurements are written.
pub(crate) fn ensure_absent(destination: &str) -> Result<(), RunError> {
    if destination == STDOUT {
        return Ok(());
    }

    let path = Path::new(destination);

    match path.try_exists() {
        Ok(false) => Ok(()),
        Ok(true) => Err(RunError::OutputExists {
            path: path.to_path_buf(),
        }),
        Err(e) => Err(RunError::Output {
            destination: destination.to_string(),
            source: e,
        }),
    }
}

/// Opens the destination that measurements are written to.
///
/// [`STDOUT`] means standard output. Anything else is a file path, which must not exist yet.
pub(crate) fn open(destination: &str) -> Result<Box<dyn Write>, RunError> {
    if destination == STDOUT {
        return Ok(Box::new(io::stdout().lock()));
    }

    let path = Path::new(destination);

    match File::create_new(path) {
        Ok(file) => Ok(Box::new(BufWriter::new(file))),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(RunError::OutputExists {
            path: PathBuf::from(destination),
        }),
        Err(e) => Err(RunError::Output {
            destination: destination.to_string(),
            source: e,
        }),
    }
}
