use thiserror::Error;

/// Errors surfaced by the Telegram transport, classified the way the rest
/// of the system reacts to them: transient, account-fatal, target-specific
/// or capacity.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Flood wait: {seconds}s")]
    FloodWait { seconds: u64 },

    #[error("Operation timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Account deactivated")]
    AuthDeactivated,

    #[error("Auth key invalid")]
    AuthKeyInvalid,

    #[error("Two-factor password required")]
    SessionPasswordNeeded,

    #[error("Channel is private or inaccessible")]
    ChannelPrivate,

    #[error("Chat admin rights required")]
    ChatAdminRequired,

    #[error("User is banned in this channel")]
    UserBannedInChannel,

    #[error("Invite link expired")]
    InviteExpired,

    #[error("Already a participant")]
    AlreadyParticipant,

    #[error("Account has joined too many channels")]
    ChannelsTooMuch,

    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Short error class string recorded on task rows and log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::FloodWait { .. } => "FLOOD_WAIT",
            GatewayError::Timeout { .. } => "TIMEOUT",
            GatewayError::Connect(_) => "CONNECT_ERROR",
            GatewayError::AuthDeactivated => "AUTH_DEACTIVATED",
            GatewayError::AuthKeyInvalid => "AUTH_KEY_INVALID",
            GatewayError::SessionPasswordNeeded => "SESSION_PASSWORD_NEEDED",
            GatewayError::ChannelPrivate => "CHANNEL_PRIVATE",
            GatewayError::ChatAdminRequired => "CHAT_ADMIN_REQUIRED",
            GatewayError::UserBannedInChannel => "USER_BANNED_IN_CHANNEL",
            GatewayError::InviteExpired => "INVITE_EXPIRED",
            GatewayError::AlreadyParticipant => "ALREADY_PARTICIPANT",
            GatewayError::ChannelsTooMuch => "CHANNELS_TOO_MUCH",
            GatewayError::NotFound(_) => "NOT_FOUND",
            GatewayError::PermissionDenied(_) => "PERMISSION_DENIED",
            GatewayError::Io(_) => "IO_ERROR",
        }
    }

    /// The platform's cooperative rate-limit signal, when this is one.
    pub fn flood_wait_seconds(&self) -> Option<u64> {
        match self {
            GatewayError::FloodWait { seconds } => Some(*seconds),
            _ => None,
        }
    }

    /// Errors that poison the account itself: the registry bans it and the
    /// rotator excludes it from further selection.
    pub fn is_account_fatal(&self) -> bool {
        matches!(
            self,
            GatewayError::AuthDeactivated
                | GatewayError::AuthKeyInvalid
                | GatewayError::SessionPasswordNeeded
        )
    }

    /// Errors scoped to the target entity; the account stays healthy and
    /// processing moves on to the next target.
    pub fn is_target_specific(&self) -> bool {
        matches!(
            self,
            GatewayError::ChannelPrivate
                | GatewayError::ChatAdminRequired
                | GatewayError::UserBannedInChannel
                | GatewayError::InviteExpired
                | GatewayError::NotFound(_)
        )
    }

    /// Retried after a cooperative sleep.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::FloodWait { .. } | GatewayError::Timeout { .. } | GatewayError::Connect(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
