use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, trace, warn};

use crate::{
    config::ClientInfo,
    error::TelOptError,
    protocols::telnet::{
        codes as tc,
        gmcp::{
            core::{CoreHello, CoreSupportsAdd, CoreSupportsRemove, CoreSupportsSet},
            message::{GmcpMessage, Message, MessageBody, MessageFactory, Package, UnknownMessage},
        },
        telopt::{BaseTelOpt, Perspective, PostWrite, TelOptEvent, TelOptState, TelOptUsage, TelnetOption, Terminal, TerminalSide},
    },
};

/// Frames a message as `<id>[ <json>]`.
pub fn encode_frame(message: &dyn Message) -> Result<Bytes, TelOptError> {
    let id = message.id().as_bytes();
    let json = message.to_json()?;

    let mut out = BytesMut::with_capacity(id.len() + 1 + json.as_ref().map_or(0, Vec::len));
    out.put_slice(id);
    if let Some(json) = json {
        out.put_u8(b' ');
        out.put_slice(&json);
    }
    Ok(out.freeze())
}

/// Splits a frame at its first space. An empty remainder counts as no payload.
pub fn split_frame(subnegotiation: &[u8]) -> (String, Option<&[u8]>) {
    match subnegotiation.iter().position(|b| *b == b' ') {
        Some(pos) => {
            let payload = &subnegotiation[pos + 1..];
            (
                String::from_utf8_lossy(&subnegotiation[..pos]).into_owned(),
                Some(payload).filter(|p| !p.is_empty()),
            )
        },
        None => (String::from_utf8_lossy(subnegotiation).into_owned(), None),
    }
}

pub fn render_subnegotiation(subnegotiation: &[u8]) -> Result<String, TelOptError> {
    if subnegotiation.is_empty() {
        return Err(TelOptError::EmptySubnegotiation { option: "GMCP" });
    }

    let (id, payload) = split_frame(subnegotiation);
    Ok(match payload {
        Some(payload) => format!("{} {}", id, String::from_utf8_lossy(payload)),
        None => id,
    })
}

fn write_message(terminal: &dyn Terminal, message: &dyn Message) -> Result<(), TelOptError> {
    let frame = encode_frame(message)?;
    trace!("GMCP: sending {}", message.id());
    terminal.write_subnegotiation(tc::GMCP, frame, None)
}

// "Char.Vitals 1" -> ("Char.Vitals", 1)
fn parse_support(entry: &str) -> Option<(String, u32)> {
    let (id, version) = entry.trim().rsplit_once(' ')?;
    let id = id.trim();
    if id.is_empty() {
        return None;
    }
    Some((id.to_string(), version.trim().parse().ok()?))
}

#[derive(Debug, Clone, Copy)]
enum SupportsChange {
    Set,
    Add,
    Remove,
}

impl SupportsChange {
    fn from_id(id: &str) -> Option<Self> {
        if id.eq_ignore_ascii_case(CoreSupportsSet::ID) {
            Some(Self::Set)
        } else if id.eq_ignore_ascii_case(CoreSupportsAdd::ID) {
            Some(Self::Add)
        } else if id.eq_ignore_ascii_case(CoreSupportsRemove::ID) {
            Some(Self::Remove)
        } else {
            None
        }
    }
}

#[derive(Default)]
struct Registry {
    packages: BTreeMap<String, Package>,
    client_messages: HashMap<String, MessageFactory>,
    server_messages: HashMap<String, MessageFactory>,
    // (sender, upper-cased identifier) -> owning package
    message_to_package: HashMap<(TerminalSide, String), String>,
    remote_supported: HashMap<String, u32>,
    intersection: HashSet<String>,
}

impl Registry {
    fn messages(&self, sender: TerminalSide) -> &HashMap<String, MessageFactory> {
        match sender {
            TerminalSide::Client => &self.client_messages,
            TerminalSide::Server => &self.server_messages,
        }
    }

    fn messages_mut(&mut self, sender: TerminalSide) -> &mut HashMap<String, MessageFactory> {
        match sender {
            TerminalSide::Client => &mut self.client_messages,
            TerminalSide::Server => &mut self.server_messages,
        }
    }

    fn insert(&mut self, package: Package) -> Result<(), TelOptError> {
        // Every constructor runs before anything is committed for this package.
        let mut entries = Vec::with_capacity(package.messages.len());
        for message in &package.messages {
            let zero = (message.create)(None)?;
            entries.push((message.sender, zero.id().to_uppercase(), message.create));
        }

        for (sender, msg_id, create) in entries {
            self.messages_mut(sender).insert(msg_id.clone(), create);
            self.message_to_package.insert((sender, msg_id), package.id.clone());
        }

        debug!("GMCP: registered package {}", package.key());
        self.packages.insert(package.id.clone(), package);
        Ok(())
    }

    fn remove(&mut self, id: &str) -> Option<Package> {
        let package = self.packages.remove(id)?;

        let owned: Vec<(TerminalSide, String)> = self
            .message_to_package
            .iter()
            .filter(|(_, owner)| *owner == id)
            .map(|(key, _)| key.clone())
            .collect();

        for key in owned {
            self.messages_mut(key.0).remove(&key.1);
            self.message_to_package.remove(&key);
        }

        debug!("GMCP: removed package {}", package.key());
        Some(package)
    }

    fn refresh_intersection(&mut self) {
        let packages = &self.packages;
        self.intersection = self
            .remote_supported
            .iter()
            .filter(|(id, version)| packages.get(*id).map_or(false, |pkg| pkg.version == **version))
            .map(|(id, _)| id.clone())
            .collect();
    }

    fn supports<'a>(packages: impl IntoIterator<Item = &'a Package>) -> Vec<String> {
        packages.into_iter().map(Package::key).collect()
    }

    fn apply_supports(&mut self, change: SupportsChange, entries: &[String]) {
        if let SupportsChange::Set = change {
            self.remote_supported.clear();
        }

        for entry in entries {
            match change {
                SupportsChange::Set | SupportsChange::Add => match parse_support(entry) {
                    Some((id, version)) => {
                        self.remote_supported.insert(id, version);
                    },
                    None => warn!("GMCP: skipping malformed supports entry {:?}", entry),
                },
                SupportsChange::Remove => {
                    let id = parse_support(entry).map(|(id, _)| id).unwrap_or_else(|| entry.trim().to_string());
                    self.remote_supported.remove(&id);
                },
            }
        }

        self.refresh_intersection();
    }
}

/// The GMCP option: a package registry, the capability handshake around it, and
/// JSON message dispatch in both directions.
pub struct Gmcp {
    base: BaseTelOpt,
    client_info: ClientInfo,
    registry: Arc<RwLock<Registry>>,
}

impl Gmcp {
    pub fn new(
        usage: TelOptUsage,
        terminal: Arc<dyn Terminal>,
        client_info: ClientInfo,
        packages: impl IntoIterator<Item = Package>,
    ) -> Result<Self, TelOptError> {
        let gmcp = Self {
            base: BaseTelOpt::new(tc::GMCP, "GMCP", usage, terminal),
            client_info,
            registry: Default::default(),
        };
        gmcp.add_packages(packages)?;
        Ok(gmcp)
    }

    fn read(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn announcing(&self) -> bool {
        self.base.side() == TerminalSide::Client && self.base.remote_state() == TelOptState::Active
    }

    /// Registers packages. A package already present at the same version is
    /// skipped; at a different version it replaces the old one outright.
    pub fn add_packages(&self, packages: impl IntoIterator<Item = Package>) -> Result<(), TelOptError> {
        let mut registry = self.write();
        let had_no_packages = registry.packages.is_empty();

        let mut additions: BTreeMap<String, Package> = packages.into_iter().map(|pkg| (pkg.id.clone(), pkg)).collect();
        let mut replaced = Vec::new();
        additions.retain(|id, pkg| match registry.packages.get(id) {
            Some(old) if old.version != pkg.version => {
                replaced.push(id.clone());
                true
            },
            Some(_) => false,
            None => true,
        });

        for id in &replaced {
            registry.remove(id);
        }
        for package in additions.values() {
            registry.insert(package.clone())?;
        }

        if self.base.side() == TerminalSide::Server {
            registry.refresh_intersection();
        }

        if additions.is_empty() || !self.announcing() {
            return Ok(());
        }

        // Announced under the write lock so a concurrent mutation cannot reorder them.
        let terminal = self.base.terminal().as_ref();
        if !replaced.is_empty() || had_no_packages {
            let supports = Registry::supports(registry.packages.values());
            write_message(terminal, &GmcpMessage::new(CoreSupportsSet(supports)))
        } else {
            let supports = Registry::supports(additions.values());
            write_message(terminal, &GmcpMessage::new(CoreSupportsAdd(supports)))
        }
    }

    /// Unregisters packages by ID. Unknown IDs are ignored, and a call that removes
    /// nothing sends no `Core.Supports.Remove`.
    pub fn remove_packages<I>(&self, ids: I) -> Result<(), TelOptError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let mut registry = self.write();
        let removed: Vec<Package> = ids.into_iter().filter_map(|id| registry.remove(id.as_ref())).collect();
        if removed.is_empty() {
            return Ok(());
        }

        if self.base.side() == TerminalSide::Server {
            registry.refresh_intersection();
        }

        if !self.announcing() {
            return Ok(());
        }
        let supports = Registry::supports(&removed);
        write_message(self.base.terminal().as_ref(), &GmcpMessage::new(CoreSupportsRemove(supports)))
    }

    /// Sends a message. Does nothing while the option is inactive, and on a server
    /// drops messages from packages the client has not declared at our version.
    pub fn send_message(&self, message: &dyn Message) -> Result<(), TelOptError> {
        if !self.base.is_active() {
            return Ok(());
        }

        if self.base.side() == TerminalSide::Server {
            let registry = self.read();
            let key = (TerminalSide::Server, message.id().to_uppercase());
            if let Some(package) = registry.message_to_package.get(&key) {
                if !registry.intersection.contains(package) {
                    trace!("GMCP: client does not support {}, dropping {}", package, message.id());
                    return Ok(());
                }
            }
        }

        write_message(self.base.terminal().as_ref(), message)
    }

    pub fn send<T: MessageBody>(&self, body: T) -> Result<(), TelOptError> {
        self.send_message(&GmcpMessage::new(body))
    }

    /// Registered packages as `"ID version"`, ordered by ID.
    pub fn packages(&self) -> Vec<String> {
        Registry::supports(self.read().packages.values())
    }

    pub fn remote_supported(&self) -> HashMap<String, u32> {
        self.read().remote_supported.clone()
    }

    pub fn intersection(&self) -> HashSet<String> {
        self.read().intersection.clone()
    }

    fn track_remote_support(&self, id: &str, payload: Option<&[u8]>) -> Result<(), TelOptError> {
        let change = match SupportsChange::from_id(id) {
            Some(change) => change,
            None => return Ok(()),
        };

        let entries: Vec<String> = match payload {
            Some(payload) => serde_json::from_slice(payload)?,
            None => Vec::new(),
        };

        let mut registry = self.write();
        registry.apply_supports(change, &entries);
        debug!("GMCP: client supports {:?}, shared {:?}", registry.remote_supported, registry.intersection);
        Ok(())
    }

    fn greeting(&self) -> PostWrite {
        let terminal = self.base.terminal().clone();
        let registry = self.registry.clone();
        let hello = CoreHello {
            client: self.client_info.name.clone(),
            version: self.client_info.version.clone(),
        };

        Box::new(move || {
            write_message(terminal.as_ref(), &GmcpMessage::new(hello))?;

            let registry = registry.read().unwrap_or_else(PoisonError::into_inner);
            let supports = Registry::supports(registry.packages.values());
            write_message(terminal.as_ref(), &GmcpMessage::new(CoreSupportsSet(supports)))
        })
    }
}

impl TelnetOption for Gmcp {
    fn code(&self) -> u8 {
        self.base.code()
    }

    fn name(&self) -> &'static str {
        self.base.name()
    }

    fn usage(&self) -> TelOptUsage {
        self.base.usage()
    }

    fn local_state(&self) -> TelOptState {
        self.base.local_state()
    }

    fn remote_state(&self) -> TelOptState {
        self.base.remote_state()
    }

    fn transition_local_state(&self, new_state: TelOptState) -> Result<Option<PostWrite>, TelOptError> {
        self.base.set_state(Perspective::Local, new_state);

        if new_state == TelOptState::Inactive && self.base.side() == TerminalSide::Server {
            let mut registry = self.write();
            registry.remote_supported.clear();
            registry.intersection.clear();
        }
        Ok(None)
    }

    fn transition_remote_state(&self, new_state: TelOptState) -> Result<Option<PostWrite>, TelOptError> {
        self.base.set_state(Perspective::Remote, new_state);

        if new_state == TelOptState::Active && self.base.side() == TerminalSide::Client {
            return Ok(Some(self.greeting()));
        }
        Ok(None)
    }

    fn subnegotiate(&self, subnegotiation: &[u8]) -> Result<(), TelOptError> {
        if subnegotiation.is_empty() {
            return Err(TelOptError::EmptySubnegotiation { option: "GMCP" });
        }

        let (id, payload) = split_frame(subnegotiation);
        let side = self.base.side();
        if side == TerminalSide::Server {
            self.track_remote_support(&id, payload)?;
        }

        let create = self.read().messages(side.opposite()).get(&id.to_uppercase()).copied();
        let message: Box<dyn Message> = match create {
            Some(create) => create(payload)?,
            None => Box::new(UnknownMessage::from_raw(&id, payload)?),
        };

        debug!("GMCP: received {}", message.id());
        self.base.terminal().raise_event(TelOptEvent::Gmcp(message));
        Ok(())
    }

    fn subnegotiation_string(&self, subnegotiation: &[u8]) -> Result<String, TelOptError> {
        render_subnegotiation(subnegotiation)
    }
}
