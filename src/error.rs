use std::fmt;

#[derive(Debug)]
pub enum DorureError {
    MalformedDocument(String),
    PageIndexOutOfRange { index: usize, page_count: usize },
    FieldNotFound(String),
    UnsupportedFormat(String),
    FlattenFailed(String),
    QuotaExceeded,
    InvalidConfiguration(String),
    Io(std::io::Error),
}

impl fmt::Display for DorureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DorureError::MalformedDocument(message) => {
                write!(f, "malformed document: {}", message)
            }
            DorureError::PageIndexOutOfRange { index, page_count } => {
                write!(
                    f,
                    "page index {} out of range (document has {} pages)",
                    index, page_count
                )
            }
            DorureError::FieldNotFound(name) => write!(f, "form field not found: {}", name),
            DorureError::UnsupportedFormat(message) => {
                write!(f, "unsupported format: {}", message)
            }
            DorureError::FlattenFailed(message) => write!(f, "flatten failed: {}", message),
            DorureError::QuotaExceeded => write!(f, "daily document quota exceeded"),
            DorureError::InvalidConfiguration(message) => {
                write!(f, "invalid configuration: {}", message)
            }
            DorureError::Io(err) => write!(f, "io error: {}", err),
        }
    }
}

impl std::error::Error for DorureError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DorureError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for DorureError {
    fn from(value: std::io::Error) -> Self {
        DorureError::Io(value)
    }
}
