use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("invalid delegation: {0}")]
    InvalidDelegation(String),
    #[error("invalid purchase request: {0}")]
    InvalidRequest(String),
    #[error("illegal {subject} transition from `{from}` to `{to}`")]
    IllegalTransition { subject: String, from: String, to: String },
    #[error("{subject} is already final (`{state}`)")]
    AlreadyFinal { subject: String, state: String },
    #[error("user `{user_id}` is not authorized to act on {subject}")]
    Unauthorized { user_id: String, subject: String },
    #[error("{kind} `{id}` was not found")]
    NotFound { kind: String, id: String },
}

impl DomainError {
    pub fn not_found(kind: &str, id: impl Into<String>) -> Self {
        Self::NotFound { kind: kind.to_owned(), id: id.into() }
    }

    pub fn class(&self) -> &'static str {
        match self {
            Self::InvalidDelegation(_) => "invalid_delegation",
            Self::InvalidRequest(_) => "invalid_request",
            Self::IllegalTransition { .. } => "illegal_transition",
            Self::AlreadyFinal { .. } => "already_final",
            Self::Unauthorized { .. } => "unauthorized",
            Self::NotFound { .. } => "not_found",
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
    #[error("workflow runtime failure: {0}")]
    Runtime(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("forbidden: {message}")]
    Forbidden { message: String, correlation_id: String },
    #[error("not found: {message}")]
    NotFound { message: String, correlation_id: String },
    #[error("conflict: {message}")]
    Conflict { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::Forbidden { .. } => "You are not authorized to perform this action.",
            Self::NotFound { .. } => "The requested item does not exist.",
            Self::Conflict { .. } => "This item has already been finalized.",
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::BadRequest { correlation_id, .. }
            | Self::Forbidden { correlation_id, .. }
            | Self::NotFound { correlation_id, .. }
            | Self::Conflict { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. }
            | Self::Internal { correlation_id, .. } => correlation_id,
        }
    }
}

impl ApplicationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::Forbidden { correlation_id: id, .. }
            | InterfaceError::NotFound { correlation_id: id, .. }
            | InterfaceError::Conflict { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        let correlation_id = "unassigned".to_owned();
        match value {
            ApplicationError::Domain(error) => {
                let message = error.to_string();
                match error {
                    DomainError::InvalidDelegation(_)
                    | DomainError::InvalidRequest(_)
                    | DomainError::IllegalTransition { .. } => {
                        Self::BadRequest { message, correlation_id }
                    }
                    DomainError::Unauthorized { .. } => Self::Forbidden { message, correlation_id },
                    DomainError::NotFound { .. } => Self::NotFound { message, correlation_id },
                    DomainError::AlreadyFinal { .. } => Self::Conflict { message, correlation_id },
                }
            }
            ApplicationError::Persistence(message) => {
                Self::ServiceUnavailable { message, correlation_id }
            }
            ApplicationError::Configuration(message) | ApplicationError::Runtime(message) => {
                Self::Internal { message, correlation_id }
            }
        }
    }
}
