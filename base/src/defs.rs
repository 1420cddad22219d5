use std::error::Error as StdError;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::result::Result as StdResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    IoError = 1,
    MalformedData = 2,
    InconsistentState = 3,
    BadParameter = 4,
    ImageUnavailable = 5,
    SolverFailure = 6,
}

#[derive(Debug)]
pub struct Error {
    pub kind: ErrorKind,
    pub description: String,
    pub source: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind, description: String) -> Self {
        Self {
            kind,
            description,
            source: None,
        }
    }

    pub fn with_source<E: StdError + Send + Sync + 'static>(
        kind: ErrorKind,
        description: String,
        source: E,
    ) -> Self {
        Self {
            kind,
            description,
            source: Some(Box::new(source)),
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{:?}: {}", self.kind, self.description)?;
        if let Some(source) = &self.source {
            write!(f, " ({})", source)?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|s| s.as_ref() as &(dyn StdError + 'static))
    }
}

pub type Result<T> = StdResult<T, Error>;

pub trait IntoResult<T> {
    fn res<F: FnOnce() -> String>(self, desc: F) -> Result<T>;
}

impl<T> IntoResult<T> for std::io::Result<T> {
    fn res<F: FnOnce() -> String>(self, desc: F) -> Result<T> {
        self.map_err(|err| Error::with_source(ErrorKind::IoError, desc(), err))
    }
}

impl<T> IntoResult<T> for image::ImageResult<T> {
    fn res<F: FnOnce() -> String>(self, desc: F) -> Result<T> {
        self.map_err(|err| {
            Error::with_source(ErrorKind::ImageUnavailable, desc(), err)
        })
    }
}

impl<T> IntoResult<T> for serde_json::Result<T> {
    fn res<F: FnOnce() -> String>(self, desc: F) -> Result<T> {
        self.map_err(|err| {
            Error::with_source(ErrorKind::MalformedData, desc(), err)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_conversion() {
        let res: std::io::Result<()> = Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no such file",
        ));
        let err = res.res(|| format!("failed to open file 'a.obj'")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::IoError);
        assert!(err.source().is_some());
        assert_eq!(
            err.to_string(),
            "IoError: failed to open file 'a.obj' (no such file)"
        );
    }

    #[test]
    fn test_json_error_conversion() {
        let res = serde_json::from_str::<Vec<u32>>("[1, 2");
        let err = res.res(|| format!("bad scene")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::MalformedData);
    }
}
