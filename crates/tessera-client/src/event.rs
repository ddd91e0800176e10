//! Manager events and actions.

use tessera_core::{EncryptionPolicy, PeerDeviceStatus};
use tessera_crypto::CurveId;

use crate::error::ManagerError;

/// Caller-chosen id correlating an asynchronous operation with its
/// [`ManagerAction::Completed`].
pub type RequestId = u64;

/// Manager-chosen id correlating a [`ManagerAction::Post`] with its
/// [`ManagerEvent::ServerResponse`].
pub type Ticket = u64;

/// Events the caller feeds into the manager.
///
/// The caller is responsible for:
/// - Forwarding application intents (create user, encrypt, update)
/// - Performing the key-server posts the manager asks for
/// - Feeding each post's outcome back, exactly once per ticket
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    /// Create a local user and register it with its key server.
    CreateUser {
        /// Completion id.
        request: RequestId,
        /// Device id of the new user.
        device_id: String,
        /// Key server to register with.
        key_server_url: String,
        /// Curve of every key the user will own.
        curve: CurveId,
        /// Size of the initial one-time prekey batch, `None` for the
        /// configured default.
        one_time_prekeys: Option<u16>,
    },

    /// Delete a local user here and on its key server.
    DeleteUser {
        /// Completion id.
        request: RequestId,
        /// User to delete.
        device_id: String,
    },

    /// Encrypt one message to several recipient devices.
    ///
    /// Recipients without a session are fetched from the key server first.
    Encrypt {
        /// Completion id.
        request: RequestId,
        /// Sending user.
        local_device_id: String,
        /// Application context bound into every ciphertext (conversation
        /// id, group id, ...).
        associated_id: Vec<u8>,
        /// Recipient device ids.
        recipients: Vec<String>,
        /// Message to encrypt.
        plaintext: Vec<u8>,
        /// Payload mode policy, `None` for the configured default.
        policy: Option<EncryptionPolicy>,
    },

    /// Run maintenance for every local user: session and prekey expiry,
    /// signed prekey rotation and one-time prekey replenishment.
    Update {
        /// Completion id.
        request: RequestId,
    },

    /// The key server answered a post.
    ServerResponse {
        /// Ticket of the post.
        ticket: Ticket,
        /// HTTP-like status code. Anything but 200 is a failure.
        status: u16,
        /// Response body.
        body: Vec<u8>,
    },

    /// A post could not be delivered.
    TransportFailed {
        /// Ticket of the post.
        ticket: Ticket,
        /// Diagnostic message.
        reason: String,
    },
}

/// Actions the manager produces for the caller to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerAction {
    /// POST `body` to the key server at `url` on behalf of `from`.
    ///
    /// The outcome must come back as a [`ManagerEvent::ServerResponse`] or
    /// [`ManagerEvent::TransportFailed`] with the same ticket.
    Post {
        /// Correlation id.
        ticket: Ticket,
        /// Key server URL.
        url: String,
        /// Sending device id.
        from: String,
        /// Encoded key-server request.
        body: Vec<u8>,
    },

    /// An asynchronous operation finished.
    Completed {
        /// Id the operation was submitted with.
        request: RequestId,
        /// Outcome.
        completion: Completion,
    },
}

/// Outcome of an asynchronous operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Outcome of [`ManagerEvent::CreateUser`].
    CreateUser(Result<(), ManagerError>),
    /// Outcome of [`ManagerEvent::DeleteUser`].
    DeleteUser(Result<(), ManagerError>),
    /// Outcome of [`ManagerEvent::Encrypt`].
    Encrypt(Result<EncryptOutput, ManagerError>),
    /// Outcome of [`ManagerEvent::Update`].
    Update(Result<(), ManagerError>),
}

impl Completion {
    /// Whether the operation succeeded.
    pub fn is_ok(&self) -> bool {
        match self {
            Self::CreateUser(result) | Self::DeleteUser(result) | Self::Update(result) => {
                result.is_ok()
            },
            Self::Encrypt(result) => result.is_ok(),
        }
    }
}

/// Per-recipient outcome of an encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecipientStatus {
    /// Encrypted; the recipient is trusted.
    Trusted,
    /// Encrypted; the recipient is known but not trusted.
    Untrusted,
    /// Encrypted; first interaction with the recipient.
    Unknown,
    /// Encrypted; the recipient is flagged unsafe.
    Unsafe,
    /// Not encrypted to.
    Fail,
}

impl From<PeerDeviceStatus> for RecipientStatus {
    fn from(status: PeerDeviceStatus) -> Self {
        match status {
            PeerDeviceStatus::Trusted => Self::Trusted,
            PeerDeviceStatus::Untrusted => Self::Untrusted,
            PeerDeviceStatus::Unknown => Self::Unknown,
            PeerDeviceStatus::Unsafe => Self::Unsafe,
        }
    }
}

/// One recipient of an encryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientOutput {
    /// Recipient device id.
    pub device_id: String,
    /// Trust status of the recipient, or `Fail`.
    pub status: RecipientStatus,
    /// Encoded envelope. Empty when `status` is `Fail`.
    pub envelope: Vec<u8>,
}

/// Result of a successful encryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptOutput {
    /// One entry per distinct recipient, in call order.
    pub recipients: Vec<RecipientOutput>,
    /// Ciphertext every recipient needs besides its envelope, set when the
    /// policy picked the shared mode.
    pub shared_ciphertext: Option<Vec<u8>>,
}

impl EncryptOutput {
    /// Output entry of one recipient.
    pub fn recipient(&self, device_id: &str) -> Option<&RecipientOutput> {
        self.recipients.iter().find(|recipient| recipient.device_id == device_id)
    }
}

/// Result of a successful decryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptOutput {
    /// Decrypted message.
    pub plaintext: Vec<u8>,
    /// Trust status of the sender as it was before this message.
    pub status: PeerDeviceStatus,
}
