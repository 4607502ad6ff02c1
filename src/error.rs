use thiserror::Error;

/// Persistence failures from any store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// A row that could not be mapped back into a domain type.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

#[derive(Debug, Error)]
pub enum NluError {
    #[error("nlu request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("nlu returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("nlu response invalid: {0}")]
    InvalidResponse(String),

    #[error("nlu endpoint invalid: {0}")]
    InvalidEndpoint(String),
}

#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("conversation {0} not found")]
    NotFound(String),

    /// Another operator won the claim, or the conversation is not waiting.
    #[error("conversation {conversation_id} already taken")]
    AlreadyTaken {
        conversation_id: String,
        operator_id: Option<String>,
    },

    /// The conversation is staffed by someone else, or by nobody.
    #[error("conversation {conversation_id} is not assigned to this operator")]
    NotAssigned {
        conversation_id: String,
        operator_id: Option<String>,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Handoff(#[from] HandoffError),

    #[error("booking commit requested without an authenticated user")]
    MissingIdentity,

    #[error("message text is empty")]
    EmptyMessage,

    #[error("booking dialogue did not settle on a reply")]
    Stalled,

    #[error("conversation belongs to another caller")]
    NotOwner,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("connection {0} is not registered")]
    UnknownConnection(usize),

    #[error("connection already registered as {0}")]
    RoleConflict(&'static str),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("identity token is invalid")]
    InvalidToken,
}
