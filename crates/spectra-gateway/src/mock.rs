//! Scripted in-memory gateway. Tests program entities, message history and
//! per-operation error scripts, then assert on the recorded traffic. No
//! network, no sessions.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use spectra_core::config::AccountConfig;

use crate::error::{GatewayError, Result};
use crate::gateway::{GatewayConnector, TelegramGateway};
use crate::proxy::ProxyEndpoint;
use crate::types::{DialogEntry, EntityInfo, GatewayMessage, MessageQuery};

/// A forward observed by the scripted gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRecord {
    pub session_handle: String,
    pub from_entity: i64,
    pub to: String,
    pub message_id: i64,
    pub reply_to: Option<i64>,
}

/// A fresh send observed by the scripted gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRecord {
    pub session_handle: String,
    pub to: String,
    pub text: String,
    pub has_media: bool,
    pub reply_to: Option<i64>,
}

#[derive(Default)]
struct ScriptState {
    entities: HashMap<String, EntityInfo>,
    messages: HashMap<i64, Vec<GatewayMessage>>,
    dialogs: Vec<DialogEntry>,
    errors: HashMap<&'static str, VecDeque<GatewayError>>,
    forwards: Vec<ForwardRecord>,
    sends: Vec<SendRecord>,
    joins: Vec<String>,
    left: Vec<i64>,
    downloads: Vec<i64>,
    avatars: Vec<i64>,
    closed: bool,
}

pub struct ScriptedGateway {
    handle: String,
    authorized: bool,
    state: Mutex<ScriptState>,
}

impl ScriptedGateway {
    pub fn new(session_handle: &str) -> Arc<Self> {
        Arc::new(Self {
            handle: session_handle.to_string(),
            authorized: true,
            state: Mutex::new(ScriptState::default()),
        })
    }

    pub fn unauthorized(session_handle: &str) -> Arc<Self> {
        Arc::new(Self {
            handle: session_handle.to_string(),
            authorized: false,
            state: Mutex::new(ScriptState::default()),
        })
    }

    /// Register an entity resolvable by id, `@username` and bare username.
    pub fn add_entity(&self, entity: EntityInfo) {
        let mut s = self.state.lock().unwrap();
        s.entities.insert(entity.id.to_string(), entity.clone());
        if let Some(name) = &entity.username {
            s.entities.insert(format!("@{name}"), entity.clone());
            s.entities.insert(name.clone(), entity.clone());
        }
        s.entities.insert(entity.title.clone(), entity);
    }

    /// Make a target string resolve to an already-registered entity (e.g.
    /// an invite hash).
    pub fn alias_entity(&self, target: &str, entity_id: i64) {
        let mut s = self.state.lock().unwrap();
        if let Some(e) = s.entities.get(&entity_id.to_string()).cloned() {
            s.entities.insert(target.to_string(), e);
        }
    }

    pub fn set_messages(&self, entity_id: i64, mut messages: Vec<GatewayMessage>) {
        messages.sort_by_key(|m| m.id);
        self.state.lock().unwrap().messages.insert(entity_id, messages);
    }

    pub fn set_dialogs(&self, dialogs: Vec<DialogEntry>) {
        self.state.lock().unwrap().dialogs = dialogs;
    }

    /// Give a user an avatar that `download_avatar` will produce.
    pub fn set_avatar(&self, user_id: i64) {
        self.state.lock().unwrap().avatars.push(user_id);
    }

    /// Queue an error for the next call of `op` ("join", "forward", "send",
    /// "fetch", "entity", "invite", "dialogs", "download").
    pub fn fail_next(&self, op: &'static str, err: GatewayError) {
        self.state
            .lock()
            .unwrap()
            .errors
            .entry(op)
            .or_default()
            .push_back(err);
    }

    pub fn forwards(&self) -> Vec<ForwardRecord> {
        self.state.lock().unwrap().forwards.clone()
    }

    pub fn sends(&self) -> Vec<SendRecord> {
        self.state.lock().unwrap().sends.clone()
    }

    pub fn joins(&self) -> Vec<String> {
        self.state.lock().unwrap().joins.clone()
    }

    pub fn left(&self) -> Vec<i64> {
        self.state.lock().unwrap().left.clone()
    }

    pub fn downloads(&self) -> Vec<i64> {
        self.state.lock().unwrap().downloads.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    fn take_error(&self, op: &'static str) -> Option<GatewayError> {
        self.state
            .lock()
            .unwrap()
            .errors
            .get_mut(op)
            .and_then(|q| q.pop_front())
    }

    fn lookup(&self, target: &str) -> Result<EntityInfo> {
        self.state
            .lock()
            .unwrap()
            .entities
            .get(target)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(target.to_string()))
    }
}

#[async_trait]
impl TelegramGateway for ScriptedGateway {
    fn session_handle(&self) -> &str {
        &self.handle
    }

    async fn is_authorized(&self) -> Result<bool> {
        Ok(self.authorized)
    }

    async fn get_entity(&self, target: &str) -> Result<EntityInfo> {
        if let Some(err) = self.take_error("entity") {
            return Err(err);
        }
        self.lookup(target)
    }

    async fn fetch_messages(
        &self,
        entity_id: i64,
        query: MessageQuery,
    ) -> Result<Vec<GatewayMessage>> {
        if let Some(err) = self.take_error("fetch") {
            return Err(err);
        }
        let s = self.state.lock().unwrap();
        let all = s.messages.get(&entity_id).cloned().unwrap_or_default();
        let mut page: Vec<GatewayMessage> = all
            .into_iter()
            .filter(|m| match query.topic_id {
                Some(topic) => m.topic_id == Some(topic),
                None => true,
            })
            .filter(|m| {
                if query.reverse {
                    m.id > query.offset_id
                } else {
                    query.offset_id == 0 || m.id < query.offset_id
                }
            })
            .collect();
        if query.reverse {
            page.sort_by_key(|m| m.id);
        } else {
            page.sort_by_key(|m| std::cmp::Reverse(m.id));
        }
        page.truncate(query.limit as usize);
        Ok(page)
    }

    async fn join_by_username(&self, username: &str) -> Result<EntityInfo> {
        if let Some(err) = self.take_error("join") {
            return Err(err);
        }
        let entity = self.lookup(&format!("@{username}"))?;
        self.state.lock().unwrap().joins.push(format!("@{username}"));
        Ok(entity)
    }

    async fn check_invite(&self, hash: &str) -> Result<()> {
        if let Some(err) = self.take_error("invite") {
            return Err(err);
        }
        self.lookup(hash).map(|_| ())
    }

    async fn import_invite(&self, hash: &str) -> Result<EntityInfo> {
        if let Some(err) = self.take_error("invite") {
            return Err(err);
        }
        let entity = self.lookup(hash)?;
        self.state.lock().unwrap().joins.push(hash.to_string());
        Ok(entity)
    }

    async fn leave(&self, entity_id: i64) -> Result<()> {
        self.state.lock().unwrap().left.push(entity_id);
        Ok(())
    }

    async fn forward_message(
        &self,
        from_entity: i64,
        to: &str,
        message_id: i64,
        reply_to: Option<i64>,
    ) -> Result<()> {
        if let Some(err) = self.take_error("forward") {
            return Err(err);
        }
        self.state.lock().unwrap().forwards.push(ForwardRecord {
            session_handle: self.handle.clone(),
            from_entity,
            to: to.to_string(),
            message_id,
            reply_to,
        });
        Ok(())
    }

    async fn send_message(
        &self,
        to: &str,
        text: &str,
        media_from: Option<&GatewayMessage>,
        reply_to: Option<i64>,
    ) -> Result<()> {
        if let Some(err) = self.take_error("send") {
            return Err(err);
        }
        self.state.lock().unwrap().sends.push(SendRecord {
            session_handle: self.handle.clone(),
            to: to.to_string(),
            text: text.to_string(),
            has_media: media_from.is_some_and(|m| m.media.is_some()),
            reply_to,
        });
        Ok(())
    }

    async fn dialogs(&self) -> Result<Vec<DialogEntry>> {
        if let Some(err) = self.take_error("dialogs") {
            return Err(err);
        }
        Ok(self.state.lock().unwrap().dialogs.clone())
    }

    async fn download_media(&self, message: &GatewayMessage, dest_dir: &Path) -> Result<PathBuf> {
        if let Some(err) = self.take_error("download") {
            return Err(err);
        }
        std::fs::create_dir_all(dest_dir)?;
        let name = message
            .file
            .as_ref()
            .and_then(|f| f.name.clone())
            .unwrap_or_else(|| format!("msg_{}.bin", message.id));
        let path = dest_dir.join(name);
        std::fs::write(&path, message.text.as_deref().unwrap_or_default())?;
        self.state.lock().unwrap().downloads.push(message.id);
        Ok(path)
    }

    async fn download_avatar(&self, user_id: i64, dest_dir: &Path) -> Result<Option<PathBuf>> {
        if let Some(err) = self.take_error("avatar") {
            return Err(err);
        }
        if !self.state.lock().unwrap().avatars.contains(&user_id) {
            return Ok(None);
        }
        std::fs::create_dir_all(dest_dir)?;
        let path = dest_dir.join(format!("{user_id}.jpg"));
        std::fs::write(&path, b"avatar")?;
        Ok(Some(path))
    }

    async fn close(&self) -> Result<()> {
        self.state.lock().unwrap().closed = true;
        Ok(())
    }
}

/// Connector over a fixed set of scripted gateways, with optional scripted
/// connect failures per handle.
#[derive(Default)]
pub struct ScriptedConnector {
    gateways: Mutex<HashMap<String, Arc<ScriptedGateway>>>,
    connect_errors: Mutex<HashMap<String, VecDeque<GatewayError>>>,
    connects: Mutex<Vec<(String, Option<u16>)>>,
}

impl ScriptedConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, gateway: Arc<ScriptedGateway>) {
        self.gateways
            .lock()
            .unwrap()
            .insert(gateway.session_handle().to_string(), gateway);
    }

    pub fn fail_connect(&self, session_handle: &str, err: GatewayError) {
        self.connect_errors
            .lock()
            .unwrap()
            .entry(session_handle.to_string())
            .or_default()
            .push_back(err);
    }

    /// (handle, proxy port) pairs in connect order.
    pub fn connects(&self) -> Vec<(String, Option<u16>)> {
        self.connects.lock().unwrap().clone()
    }
}

#[async_trait]
impl GatewayConnector for ScriptedConnector {
    async fn connect(
        &self,
        account: &AccountConfig,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<Arc<dyn TelegramGateway>> {
        self.connects
            .lock()
            .unwrap()
            .push((account.session_handle.clone(), proxy.map(|p| p.port)));

        if let Some(err) = self
            .connect_errors
            .lock()
            .unwrap()
            .get_mut(&account.session_handle)
            .and_then(|q| q.pop_front())
        {
            return Err(err);
        }

        self.gateways
            .lock()
            .unwrap()
            .get(&account.session_handle)
            .cloned()
            .map(|g| g as Arc<dyn TelegramGateway>)
            .ok_or_else(|| GatewayError::Connect(format!("no session: {}", account.session_handle)))
    }
}
