use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Definition source unreadable at startup. Fatal.
    #[error("config error ({source_name}): {message}")]
    ConfigLoad {
        source_name: String,
        message: String,
    },

    #[error("unknown chronicle: {0}")]
    ChronicleNotFound(String),

    #[error("no descriptor for {file} in chronicle {chronicle}")]
    DescriptorNotFound { chronicle: String, file: String },

    #[error("Not found {cipher} encryptor of the file: {file}")]
    CipherNotFound { cipher: String, file: String },

    #[error("malformed binary{}: {message}", fmt_offset(.offset))]
    MalformedBinary {
        offset: Option<usize>,
        message: String,
    },

    /// `line` and `offset` are 1-based; 0 means the position is unknown.
    #[error("malformed text{}: {message}", fmt_position(.line, .offset))]
    MalformedText {
        line: usize,
        offset: usize,
        message: String,
    },

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("another task is already running")]
    TaskBusy,

    #[error("cancelled")]
    Cancelled,

    #[error("runtime error: {0}")]
    Runtime(String),
}

fn fmt_offset(offset: &Option<usize>) -> String {
    match offset {
        Some(off) => format!(" at byte {off:#x}"),
        None => String::new(),
    }
}

fn fmt_position(line: &usize, offset: &usize) -> String {
    match (*line, *offset) {
        (0, 0) => String::new(),
        (0, o) => format!(" (offset {o})"),
        (l, 0) => format!(" at line {l}"),
        (l, o) => format!(" at line {l} (offset {o})"),
    }
}

impl DatError {
    pub(crate) fn binary(offset: usize, message: impl Into<String>) -> Self {
        DatError::MalformedBinary {
            offset: Some(offset),
            message: message.into(),
        }
    }

    pub(crate) fn config(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        DatError::ConfigLoad {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, DatError::Cancelled)
    }
}

// Convenient crate-wide result type
pub type Result<T> = std::result::Result<T, DatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_error_formats_known_position() {
        let e = DatError::MalformedText {
            line: 3,
            offset: 17,
            message: "bad value".into(),
        };
        assert_eq!(e.to_string(), "malformed text at line 3 (offset 17): bad value");
    }

    #[test]
    fn text_error_omits_unknown_position() {
        let e = DatError::MalformedText {
            line: 0,
            offset: 0,
            message: "truncated".into(),
        };
        assert_eq!(e.to_string(), "malformed text: truncated");
    }

    #[test]
    fn cipher_not_found_names_cipher_and_file() {
        let e = DatError::CipherNotFound {
            cipher: "413".into(),
            file: "NpcGrp.dat".into(),
        };
        assert_eq!(e.to_string(), "Not found 413 encryptor of the file: NpcGrp.dat");
    }
}
