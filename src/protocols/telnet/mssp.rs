use std::{
    str::FromStr,
    sync::{Arc, PoisonError, RwLock},
};

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    error::TelOptError,
    protocols::telnet::{
        codes as tc,
        telopt::{BaseTelOpt, Perspective, PostWrite, TelOptEvent, TelOptState, TelOptUsage, TelnetOption, Terminal},
    },
};

/// One complete MSSP snapshot. Decoding always builds a fresh record; nothing is
/// patched in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MsspData {
    pub name: String,
    pub players: i64,
    pub uptime: Option<DateTime<Utc>>,

    pub charset: Vec<String>,
    pub codebase: Vec<String>,
    pub contact: String,
    pub crawl_delay: i64,
    pub created: i64,
    pub discord_url: Option<String>,
    pub hostname: String,
    pub icon: Option<String>,
    pub ip: String,
    pub ipv6: String,
    pub language: String,
    pub location: String,
    pub minimum_age: i64,
    pub port: Vec<i64>,
    pub referral: Vec<String>,
    pub ssl_port: i64,
    pub website: Option<String>,

    pub family: Vec<String>,
    pub genre: String,
    pub gameplay: String,
    pub status: String,
    pub game_system: String,
    pub intermud: Vec<String>,
    pub subgenre: String,

    pub areas: i64,
    pub help_files: i64,
    pub mobiles: i64,
    pub objects: i64,
    pub rooms: i64,
    pub classes: i64,
    pub levels: i64,
    pub races: i64,
    pub skills: i64,

    pub ansi: bool,
    pub utf8: bool,
    pub vt100: bool,
    pub xterm_256_colors: bool,
    pub xterm_true_colors: bool,

    pub pay_to_play: bool,
    pub pay_for_perks: bool,

    pub hiring_builders: bool,
    pub hiring_coders: bool,
}

// Tokens run until the next VAR/VAL byte. There is no escaping.
fn read_token(b: &[u8]) -> (String, usize) {
    let end = b
        .iter()
        .position(|c| *c == tc::MSSP_VAR || *c == tc::MSSP_VAL)
        .unwrap_or(b.len());
    (String::from_utf8_lossy(&b[..end]).into_owned(), end)
}

fn read_values(b: &[u8]) -> (Vec<String>, usize) {
    let mut values = Vec::new();
    let mut index = 0;

    while index < b.len() && b[index] == tc::MSSP_VAL {
        index += 1;
        let (token, consumed) = read_token(&b[index..]);
        values.push(token);
        index += consumed;
    }

    (values, index)
}

fn parse_num<T: FromStr + Default>(token: &str) -> T {
    token.trim().parse().unwrap_or_default()
}

fn parse_bool(token: &str) -> bool {
    parse_num::<i64>(token) > 0
}

fn parse_time(token: &str) -> Option<DateTime<Utc>> {
    let secs: i64 = token.trim().parse().ok()?;
    Utc.timestamp_opt(secs, 0).single()
}

fn parse_url(token: &str) -> Option<String> {
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

fn last(values: &[String]) -> &str {
    values.last().map(String::as_str).unwrap_or("")
}

fn strings(values: Vec<String>) -> Vec<String> {
    values.into_iter().filter(|v| !v.is_empty()).collect()
}

fn numbers(values: &[String]) -> Vec<i64> {
    values.iter().map(|v| parse_num::<i64>(v)).filter(|v| *v != 0).collect()
}

impl MsspData {
    /// Best-effort decode. Unknown variables are skipped, bad scalars become zero values.
    pub fn decode(b: &[u8]) -> Self {
        let mut data = MsspData::default();
        let mut index = 0;

        while index < b.len() && b[index] == tc::MSSP_VAR {
            index += 1;

            let (name, consumed) = read_token(&b[index..]);
            index += consumed;

            let (values, consumed) = read_values(&b[index..]);
            index += consumed;

            data.apply(&name.to_uppercase(), values);
        }

        data
    }

    fn apply(&mut self, name: &str, values: Vec<String>) {
        let value = last(&values);

        match name {
            "NAME" => self.name = value.to_string(),
            "PLAYERS" => self.players = parse_num(value),
            "UPTIME" => self.uptime = parse_time(value),

            "CHARSET" => self.charset = strings(values),
            "CODEBASE" => self.codebase = strings(values),
            "CONTACT" => self.contact = value.to_string(),
            "CRAWL DELAY" => self.crawl_delay = parse_num(value),
            "CREATED" => self.created = parse_num(value),
            "DISCORD" => self.discord_url = parse_url(value),
            "HOSTNAME" => self.hostname = value.to_string(),
            "ICON" => self.icon = parse_url(value),
            "IP" => self.ip = value.to_string(),
            "IPV6" => self.ipv6 = value.to_string(),
            "LANGUAGE" => self.language = value.to_string(),
            "LOCATION" => self.location = value.to_string(),
            "MINIMUM AGE" => self.minimum_age = parse_num(value),
            "PORT" => self.port = numbers(&values),
            "REFERRAL" => self.referral = strings(values),
            "SSL" => self.ssl_port = parse_num(value),
            "WEBSITE" => self.website = parse_url(value),

            "FAMILY" => self.family = strings(values),
            "GENRE" => self.genre = value.to_string(),
            "GAMEPLAY" => self.gameplay = value.to_string(),
            "STATUS" => self.status = value.to_string(),
            "GAMESYSTEM" => self.game_system = value.to_string(),
            "INTERMUD" => self.intermud = strings(values),
            "SUBGENRE" => self.subgenre = value.to_string(),

            "AREAS" => self.areas = parse_num(value),
            "HELPFILES" => self.help_files = parse_num(value),
            "MOBILES" => self.mobiles = parse_num(value),
            "OBJECTS" => self.objects = parse_num(value),
            "ROOMS" => self.rooms = parse_num(value),
            "CLASSES" => self.classes = parse_num(value),
            "LEVELS" => self.levels = parse_num(value),
            "RACES" => self.races = parse_num(value),
            "SKILLS" => self.skills = parse_num(value),

            "ANSI" => self.ansi = parse_bool(value),
            "UTF-8" => self.utf8 = parse_bool(value),
            "VT100" => self.vt100 = parse_bool(value),
            "XTERM 256 COLORS" => self.xterm_256_colors = parse_bool(value),
            "XTERM TRUE COLORS" => self.xterm_true_colors = parse_bool(value),

            "PAY TO PLAY" => self.pay_to_play = parse_bool(value),
            "PAY FOR PERKS" => self.pay_for_perks = parse_bool(value),

            "HIRING BUILDERS" => self.hiring_builders = parse_bool(value),
            "HIRING CODERS" => self.hiring_coders = parse_bool(value),

            _ => debug!("MSSP: skipping unknown variable {:?}", name),
        }
    }

    /// Encodes every non-default field. Booleans are always sent.
    pub fn encode(&self) -> Bytes {
        let mut out = MsspWriter::default();

        out.string("NAME", &self.name);
        out.int("PLAYERS", self.players);
        if let Some(uptime) = self.uptime {
            out.value("UPTIME", &uptime.timestamp().to_string());
        }

        out.strings("CHARSET", &self.charset);
        out.strings("CODEBASE", &self.codebase);
        out.string("CONTACT", &self.contact);
        out.int("CRAWL DELAY", self.crawl_delay);
        out.int("CREATED", self.created);
        out.url("DISCORD", &self.discord_url);
        out.string("HOSTNAME", &self.hostname);
        out.url("ICON", &self.icon);
        out.string("IP", &self.ip);
        out.string("IPV6", &self.ipv6);
        out.string("LANGUAGE", &self.language);
        out.string("LOCATION", &self.location);
        out.int("MINIMUM AGE", self.minimum_age);
        out.ints("PORT", &self.port);
        out.strings("REFERRAL", &self.referral);
        out.int("SSL", self.ssl_port);
        out.url("WEBSITE", &self.website);

        out.strings("FAMILY", &self.family);
        out.string("GENRE", &self.genre);
        out.string("GAMEPLAY", &self.gameplay);
        out.string("STATUS", &self.status);
        out.string("GAMESYSTEM", &self.game_system);
        out.strings("INTERMUD", &self.intermud);
        out.string("SUBGENRE", &self.subgenre);

        out.int("AREAS", self.areas);
        out.int("HELPFILES", self.help_files);
        out.int("MOBILES", self.mobiles);
        out.int("OBJECTS", self.objects);
        out.int("ROOMS", self.rooms);
        out.int("CLASSES", self.classes);
        out.int("LEVELS", self.levels);
        out.int("RACES", self.races);
        out.int("SKILLS", self.skills);

        out.boolean("ANSI", self.ansi);
        out.boolean("UTF-8", self.utf8);
        out.boolean("VT100", self.vt100);
        out.boolean("XTERM 256 COLORS", self.xterm_256_colors);
        out.boolean("XTERM TRUE COLORS", self.xterm_true_colors);

        out.boolean("PAY TO PLAY", self.pay_to_play);
        out.boolean("PAY FOR PERKS", self.pay_for_perks);

        out.boolean("HIRING BUILDERS", self.hiring_builders);
        out.boolean("HIRING CODERS", self.hiring_coders);

        out.buffer.freeze()
    }
}

#[derive(Default)]
struct MsspWriter {
    buffer: BytesMut,
}

impl MsspWriter {
    fn var(&mut self, name: &str) {
        self.buffer.put_u8(tc::MSSP_VAR);
        self.buffer.put_slice(name.as_bytes());
    }

    fn value(&mut self, name: &str, value: &str) {
        self.var(name);
        self.buffer.put_u8(tc::MSSP_VAL);
        self.buffer.put_slice(value.as_bytes());
    }

    fn string(&mut self, name: &str, value: &str) {
        if !value.is_empty() {
            self.value(name, value);
        }
    }

    fn strings(&mut self, name: &str, values: &[String]) {
        if values.is_empty() {
            return;
        }
        self.var(name);
        for value in values {
            self.buffer.put_u8(tc::MSSP_VAL);
            self.buffer.put_slice(value.as_bytes());
        }
    }

    fn int(&mut self, name: &str, value: i64) {
        if value != 0 {
            self.value(name, &value.to_string());
        }
    }

    fn ints(&mut self, name: &str, values: &[i64]) {
        if values.is_empty() {
            return;
        }
        self.var(name);
        for value in values {
            self.buffer.put_u8(tc::MSSP_VAL);
            self.buffer.put_slice(value.to_string().as_bytes());
        }
    }

    fn boolean(&mut self, name: &str, value: bool) {
        self.value(name, if value { "1" } else { "0" });
    }

    fn url(&mut self, name: &str, value: &Option<String>) {
        if let Some(url) = value {
            self.value(name, url);
        }
    }
}

/// Renders a raw MSSP block as `VAR 'NAME' VAL 'value' ...` for logs.
pub fn render_subnegotiation(b: &[u8]) -> String {
    let mut parts = Vec::new();
    let mut index = 0;

    while index < b.len() && b[index] == tc::MSSP_VAR {
        index += 1;
        let (token, consumed) = read_token(&b[index..]);
        parts.push(format!("VAR '{}'", token));
        index += consumed;

        while index < b.len() && b[index] == tc::MSSP_VAL {
            index += 1;
            let (token, consumed) = read_token(&b[index..]);
            parts.push(format!("VAL '{}'", token));
            index += consumed;
        }
    }

    parts.join(" ")
}

pub struct Mssp {
    base: BaseTelOpt,
    data: Arc<RwLock<Arc<MsspData>>>,
}

impl Mssp {
    pub fn new(usage: TelOptUsage, terminal: Arc<dyn Terminal>, data: MsspData) -> Self {
        Self {
            base: BaseTelOpt::new(tc::MSSP, "MSSP", usage, terminal),
            data: Arc::new(RwLock::new(Arc::new(data))),
        }
    }

    /// The latest complete snapshot, local or received.
    pub fn data(&self) -> Arc<MsspData> {
        self.data.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set_data(&self, data: MsspData) {
        *self.data.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(data);
    }
}

impl TelnetOption for Mssp {
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

        if new_state != TelOptState::Active {
            return Ok(None);
        }

        let terminal = self.base.terminal().clone();
        let data = self.data.clone();
        Ok(Some(Box::new(move || {
            let snapshot = data.read().unwrap_or_else(PoisonError::into_inner).clone();
            terminal.write_subnegotiation(tc::MSSP, snapshot.encode(), None)
        })))
    }

    fn transition_remote_state(&self, new_state: TelOptState) -> Result<Option<PostWrite>, TelOptError> {
        self.base.set_state(Perspective::Remote, new_state);
        Ok(None)
    }

    fn subnegotiate(&self, subnegotiation: &[u8]) -> Result<(), TelOptError> {
        let data = MsspData::decode(subnegotiation);
        self.set_data(data.clone());
        self.base.terminal().raise_event(TelOptEvent::MsspUpdated(data));
        Ok(())
    }

    fn subnegotiation_string(&self, subnegotiation: &[u8]) -> Result<String, TelOptError> {
        Ok(render_subnegotiation(subnegotiation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(parts: &[(u8, &str)]) -> Vec<u8> {
        let mut out = Vec::new();
        for (code, token) in parts {
            out.push(*code);
            out.extend_from_slice(token.as_bytes());
        }
        out
    }

    const VAR: u8 = tc::MSSP_VAR;
    const VAL: u8 = tc::MSSP_VAL;

    #[test]
    fn last_value_wins_for_scalars() {
        let raw = block(&[(VAR, "NAME"), (VAL, "Foo"), (VAR, "PLAYERS"), (VAL, "3"), (VAL, "5")]);
        let data = MsspData::decode(&raw);
        assert_eq!(data.name, "Foo");
        assert_eq!(data.players, 5);
    }

    #[test]
    fn names_match_case_insensitively() {
        let raw = block(&[(VAR, "name"), (VAL, "Lower"), (VAR, "Xterm 256 Colors"), (VAL, "1")]);
        let data = MsspData::decode(&raw);
        assert_eq!(data.name, "Lower");
        assert!(data.xterm_256_colors);
    }

    #[test]
    fn unknown_blocks_are_skipped_whole() {
        let raw = block(&[
            (VAR, "FAVORITE COLOR"), (VAL, "blue"), (VAL, "green"),
            (VAR, "ROOMS"), (VAL, "4000"),
        ]);
        let data = MsspData::decode(&raw);
        assert_eq!(data.rooms, 4000);
        assert_eq!(data, MsspData { rooms: 4000, ..Default::default() });
    }

    #[test]
    fn bad_scalars_degrade_to_zero() {
        let raw = block(&[(VAR, "PLAYERS"), (VAL, "lots"), (VAR, "UPTIME"), (VAL, "yesterday"), (VAR, "ANSI"), (VAL, "yes")]);
        let data = MsspData::decode(&raw);
        assert_eq!(data.players, 0);
        assert_eq!(data.uptime, None);
        assert!(!data.ansi);
    }

    #[test]
    fn list_fields_keep_order_and_drop_zero_values() {
        let raw = block(&[
            (VAR, "PORT"), (VAL, "4000"), (VAL, "nope"), (VAL, "4001"),
            (VAR, "CODEBASE"), (VAL, "Diku"), (VAL, ""), (VAL, "Merc"),
        ]);
        let data = MsspData::decode(&raw);
        assert_eq!(data.port, vec![4000, 4001]);
        assert_eq!(data.codebase, vec!["Diku".to_string(), "Merc".to_string()]);
    }

    #[test]
    fn encode_omits_defaults_but_always_sends_booleans() {
        let data = MsspData { name: "Foo".into(), ..Default::default() };
        let rendered = render_subnegotiation(&data.encode());
        assert!(rendered.starts_with("VAR 'NAME' VAL 'Foo' VAR 'ANSI' VAL '0'"));
        assert!(!rendered.contains("PLAYERS"));
        assert!(!rendered.contains("UPTIME"));
        assert!(rendered.ends_with("VAR 'HIRING CODERS' VAL '0'"));
    }

    #[test]
    fn encoded_record_decodes_to_itself() {
        let data = MsspData {
            name: "Ashen Keep".into(),
            players: 12,
            uptime: Utc.timestamp_opt(1_700_000_000, 0).single(),
            charset: vec!["ASCII".into(), "UTF-8".into()],
            discord_url: Some("https://discord.gg/abc".into()),
            port: vec![4000, 4443],
            ssl_port: 4443,
            minimum_age: 13,
            family: vec!["DikuMUD".into()],
            game_system: "Custom".into(),
            help_files: 300,
            utf8: true,
            hiring_coders: true,
            ..Default::default()
        };
        assert_eq!(MsspData::decode(&data.encode()), data);
    }

    #[test]
    fn render_shows_every_token() {
        let raw = block(&[(VAR, "PORT"), (VAL, "1"), (VAL, "2")]);
        assert_eq!(render_subnegotiation(&raw), "VAR 'PORT' VAL '1' VAL '2'");
    }
}
