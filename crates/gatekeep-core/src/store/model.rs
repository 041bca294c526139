use std::fmt;

/// Settings keys of the persisted link state.
pub const KEY_LINKED: &str = "server.linked";
pub const KEY_SERVER_ID: &str = "server.server-id";
pub const KEY_OWNER_UUID: &str = "server.owner-uuid";
pub const KEY_SERVER_UUID: &str = "server.server-uuid";
pub const KEY_VERIFICATION_TOKEN: &str = "server.verification-token";
pub const KEY_VALIDATION_TTL: &str = "cache.validation-ttl";

pub const DEFAULT_VALIDATION_TTL_SECS: u64 = 300;

/// The installation's relationship to the remote account, as persisted.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct LinkRecord {
    pub linked: bool,
    /// Id the installation was linked under; empty when unlinked.
    pub server_id: String,
    pub owner_uuid: Option<String>,
    /// Stable installation id, generated once.
    pub server_uuid: Option<String>,
    pub verification_token: Option<String>,
}

impl LinkRecord {
    /// Owner and token only mean something while linked.
    pub fn is_consistent(&self) -> bool {
        self.linked || (self.owner_uuid.is_none() && self.verification_token.is_none())
    }

    /// Drop everything tied to the account, keep the installation id.
    pub fn clear_link(&mut self) {
        self.linked = false;
        self.server_id.clear();
        self.owner_uuid = None;
        self.verification_token = None;
    }
}

impl fmt::Debug for LinkRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkRecord")
            .field("linked", &self.linked)
            .field("server_id", &self.server_id)
            .field("owner_uuid", &self.owner_uuid)
            .field("server_uuid", &self.server_uuid)
            .field(
                "verification_token",
                &self.verification_token.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}
