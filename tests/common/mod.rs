use mudopts::protocols::telnet::codes as tc;

/// Splits wire bytes into `(option, payload)` subnegotiation frames, undoubling IAC.
/// Bytes outside frames are returned as their own chunks with option `None`.
pub fn frames(wire: &[u8]) -> Vec<(Option<u8>, Vec<u8>)> {
    let mut out = Vec::new();
    let mut plain = Vec::new();
    let mut i = 0;

    while i < wire.len() {
        if wire[i] == tc::IAC && wire.get(i + 1) == Some(&tc::SB) && i + 2 < wire.len() {
            if !plain.is_empty() {
                out.push((None, std::mem::take(&mut plain)));
            }
            let option = wire[i + 2];
            let mut payload = Vec::new();
            i += 3;
            while i < wire.len() {
                if wire[i] == tc::IAC && wire.get(i + 1) == Some(&tc::SE) {
                    i += 2;
                    break;
                }
                if wire[i] == tc::IAC && wire.get(i + 1) == Some(&tc::IAC) {
                    i += 1;
                }
                payload.push(wire[i]);
                i += 1;
            }
            out.push((Some(option), payload));
        } else {
            plain.push(wire[i]);
            i += 1;
        }
    }

    if !plain.is_empty() {
        out.push((None, plain));
    }
    out
}
