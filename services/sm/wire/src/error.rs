//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Input did not contain a complete element
    #[error("incomplete element")]
    Incomplete,

    /// XML could not be parsed
    #[error("malformed xml: {0}")]
    Xml(String),

    /// A frame grew past the configured maximum size
    #[error("frame exceeds {limit} bytes")]
    FrameTooLarge {
        /// Configured maximum
        limit: usize,
    },

    /// Element name is not defined in the stream management namespace
    #[error("unknown element <{0}/>")]
    UnknownElement(String),

    /// A required attribute is absent
    #[error("<{element}/> is missing attribute '{attribute}'")]
    MissingAttribute {
        /// Element local name
        element: &'static str,
        /// Attribute name
        attribute: &'static str,
    },

    /// An attribute value could not be interpreted
    #[error("<{element}/> has invalid '{attribute}' value '{value}'")]
    InvalidAttribute {
        /// Element local name
        element: &'static str,
        /// Attribute name
        attribute: &'static str,
        /// Raw attribute value
        value: String,
    },
}

impl From<quick_xml::Error> for WireError {
    fn from(err: quick_xml::Error) -> Self {
        WireError::Xml(err.to_string())
    }
}
