/// Connection handshake
///
/// The first command on every connection is a legacy `isMaster` carrying
/// `helloOk: true` and the client metadata. Nodes that answer `helloOk` are
/// checked with `hello` afterwards.
use bson::{doc, Document};

use super::connection::Connection;
use super::wire::{next_request_id, DEFAULT_MAX_MESSAGE_SIZE};
use crate::config::CredentialConfig;
use crate::error::{bson_as_i32, RutaError, RutaResult};

#[derive(Debug, Clone)]
pub struct Handshaker {
    metadata: Document,
    /// `<source>.<username>` when a credential is configured
    sasl_user: Option<String>,
}

impl Handshaker {
    pub fn new(app_name: Option<&str>, credential: Option<&CredentialConfig>) -> Self {
        let mut metadata = doc! {
            "driver": { "name": "ruta", "version": env!("CARGO_PKG_VERSION") },
            "os": { "type": std::env::consts::OS, "architecture": std::env::consts::ARCH },
            "platform": "rust",
        };
        if let Some(name) = app_name {
            metadata.insert("application", doc! { "name": name });
        }

        Self {
            metadata,
            sasl_user: credential.map(|c| format!("{}.{}", c.source, c.username)),
        }
    }

    /// First command sent on a new connection
    pub fn handshake_command(&self) -> Document {
        let mut command = doc! {
            "isMaster": 1,
            "helloOk": true,
            "client": self.metadata.clone(),
        };
        // Credentials attach here; the authentication exchange itself is not run.
        if let Some(user) = &self.sasl_user {
            command.insert("saslSupportedMechs", user.clone());
        }
        command.insert("$db", "admin");
        command
    }

    /// Status check for an already handshaken monitoring connection
    pub fn heartbeat_command(hello_ok: bool) -> Document {
        if hello_ok {
            doc! { "hello": 1, "$db": "admin" }
        } else {
            doc! { "isMaster": 1, "$db": "admin" }
        }
    }

    /// Run the handshake and record the negotiated capabilities on `conn`
    pub async fn handshake(&self, conn: &mut Connection) -> RutaResult<Document> {
        let reply = conn
            .send_command(next_request_id(), self.handshake_command())
            .await?;
        if let Some(error) = RutaError::from_reply(&reply) {
            conn.close();
            return Err(error);
        }

        let hello_ok = reply.get_bool("helloOk").unwrap_or(false);
        let max_wire_version = reply.get("maxWireVersion").and_then(bson_as_i32).unwrap_or(0);
        let max_message_size = reply
            .get("maxMessageSizeBytes")
            .and_then(bson_as_i32)
            .and_then(|size| usize::try_from(size).ok())
            .unwrap_or(DEFAULT_MAX_MESSAGE_SIZE);
        conn.record_handshake(hello_ok, max_wire_version, max_message_size);
        Ok(reply)
    }
}
