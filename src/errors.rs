//! Error types exposed by this crate.
//!
//! Errors are split by where they surface: [`ServerError`] is returned from
//! client-facing server calls, [`ApplyError`] travels inside the apply result
//! delivered through the wait registry, and the storage layer wraps io causes
//! in [`StorageError`].

use anyerror::AnyError;

use crate::membership::MembershipError;

/// Error returned by client-facing server operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServerError {
    #[error("server stopped")]
    Stopped,

    #[error("server is stopping")]
    Stopping,

    #[error("request timed out")]
    Timeout,

    #[error("request timed out, possibly due to previous leader failure")]
    TimeoutDueToLeaderFail,

    #[error("timed out waiting for the applied index to reach the committed index")]
    TimeoutWaitAppliedIndex,

    #[error("leader changed")]
    LeaderChanged,

    #[error("not leader")]
    NotLeader,

    #[error("request is too large")]
    RequestTooLarge,

    #[error("no space left in the backend")]
    NoSpace,

    #[error("data is corrupt")]
    Corrupt,

    #[error("rejected message from removed member")]
    RejectFromRemovedMember,

    #[error("cannot process message with unexpected recipient")]
    UnexpectedRecipient,

    #[error("re-configuration failed due to not enough started members")]
    NotEnoughStartedMembers,

    #[error("can only promote a learner member which is in sync with leader")]
    LearnerNotReady,

    #[error(transparent)]
    Membership(#[from] MembershipError),

    #[error("proposal dropped by consensus")]
    ProposalDropped,

    #[error("feature is not enabled: {0}")]
    FeatureDisabled(String),
}

/// Error carried inside an apply result.
///
/// The applier never aborts the apply loop on these; they are recorded in the
/// result and delivered to the waiting proposer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApplyError {
    #[error("key not found")]
    KeyNotFound,

    #[error("required revision has been compacted")]
    Compacted,

    #[error("required revision is a future revision")]
    FutureRev,

    #[error("no space left in the backend")]
    NoSpace,

    #[error("data is corrupt")]
    Corrupt,

    #[error("authentication failed, invalid user ID or password")]
    AuthFailed,

    #[error("permission denied")]
    PermissionDenied,

    #[error("user name not found")]
    UserNotFound,

    #[error("user name already exists")]
    UserAlreadyExist,

    #[error("role name not found")]
    RoleNotFound,

    #[error("role name already exists")]
    RoleAlreadyExist,

    #[error("auth is not enabled")]
    AuthNotEnabled,

    #[error("lease not found")]
    LeaseNotFound,

    #[error("lease already exists")]
    LeaseExist,

    #[error("member not found")]
    MemberNotFound,

    #[error("operation not supported at current cluster version")]
    VersionNotSupported,

    #[error("feature is not enabled: {feature}")]
    FeatureDisabled { feature: String },
}

/// Storage-layer failure, fatal to the apply path.
///
/// Backend write errors are a data-loss risk and abort the server; only
/// benign not-found lookups are reported as recoverable errors upstream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("storage error: {context}: {source}")]
pub struct StorageError {
    pub context: String,

    #[source]
    pub source: AnyError,
}

impl StorageError {
    pub fn new(context: impl ToString, source: impl std::error::Error + 'static) -> Self {
        Self {
            context: context.to_string(),
            source: AnyError::new(&source),
        }
    }

    pub fn from_io(context: impl ToString, source: std::io::Error) -> Self {
        Self::new(context, source)
    }
}
