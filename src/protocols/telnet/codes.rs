pub const SE: u8 = 240;
pub const SB: u8 = 250;
pub const IAC: u8 = 255;

// The following are special MUD specific protocols.

// Mud Server Status Protocol
pub const MSSP: u8 = 70;

// Compression
// pub const MCCP1: u8 = 85 - this is deprecrated
pub const MCCP2: u8 = 86;
pub const MCCP3: u8 = 87;

// GMCP - Generic Mud Communication Protocol
pub const GMCP: u8 = 201;

// MSSP subnegotiation tokens
pub const MSSP_VAR: u8 = 1;
pub const MSSP_VAL: u8 = 2;

pub fn option_name(code: u8) -> Option<&'static str> {
    match code {
        MSSP => Some("MSSP"),
        MCCP2 => Some("MCCP2"),
        MCCP3 => Some("MCCP3"),
        GMCP => Some("GMCP"),
        _ => None,
    }
}

pub fn option_code(name: &str) -> Option<u8> {
    [MSSP, MCCP2, MCCP3, GMCP]
        .into_iter()
        .find(|code| option_name(*code).map_or(false, |known| known.eq_ignore_ascii_case(name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_and_codes_agree() {
        assert_eq!(option_code("gmcp"), Some(GMCP));
        assert_eq!(option_code("MCCP3"), Some(MCCP3));
        assert_eq!(option_code("naws"), None);
        assert_eq!(option_name(MCCP2), Some("MCCP2"));
    }
}
