use crate::resp::Reply;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("ERR unknown command '{0}'")]
    UnknownCommand(String),

    #[error("ERR wrong number of arguments for '{0}' command")]
    WrongArgCount(String),

    #[error("ERR syntax error")]
    Syntax,

    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,

    #[error("ERR no such key")]
    NoSuchKey,

    #[error("ERR value is not an integer or out of range")]
    NotInteger,

    #[error("ERR value is not a valid float")]
    NotFloat,

    #[error("ERR index out of range")]
    IndexOutOfRange,

    #[error("ERR timeout")]
    Timeout,

    #[error("ERR {0}")]
    Generic(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Render this error as the reply sent back to the client.
    pub fn into_reply(self) -> Reply {
        Reply::Error(self.to_string())
    }
}

pub type ServerResult<T> = Result<T, ServerError>;
