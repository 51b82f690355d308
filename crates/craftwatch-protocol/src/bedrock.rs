//! RakNet "offline" packets used by Minecraft Bedrock server discovery:
//! Unconnected Ping (0x01) in, Unconnected Pong (0x1c) out. Everything else
//! on the wire is ignored.

/// 16-byte offline message marker present in every unconnected packet.
pub const OFFLINE_MAGIC: [u8; 16] = [
    0x00, 0xff, 0xff, 0x00, 0xfe, 0xfe, 0xfe, 0xfe, 0xfd, 0xfd, 0xfd, 0xfd, 0x12, 0x34, 0x56,
    0x78,
];

pub const ID_UNCONNECTED_PING: u8 = 0x01;
pub const ID_UNCONNECTED_PONG: u8 = 0x1c;

/// A parsed Unconnected Ping:
/// `[0x01][time:i64 BE][magic:16][client_guid:i64 BE]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnconnectedPing {
    pub client_time: i64,
    pub client_guid: i64,
}

/// Parse an Unconnected Ping datagram, `None` for anything else.
pub fn parse_unconnected_ping(data: &[u8]) -> Option<UnconnectedPing> {
    if data.len() < 33 || data[0] != ID_UNCONNECTED_PING {
        return None;
    }
    if data[9..25] != OFFLINE_MAGIC {
        return None;
    }

    let client_time = i64::from_be_bytes(data[1..9].try_into().ok()?);
    let client_guid = i64::from_be_bytes(data[25..33].try_into().ok()?);
    Some(UnconnectedPing {
        client_time,
        client_guid,
    })
}

/// Display fields for an Unconnected Pong.
#[derive(Debug, Clone)]
pub struct PongInfo<'a> {
    pub motd: &'a str,
    pub protocol_version: i32,
    pub version_name: &'a str,
    pub players_online: u32,
    pub max_players: u32,
    pub server_guid: i64,
    pub port_v4: u16,
    pub port_v6: u16,
}

/// Build an Unconnected Pong:
/// `[0x1c][time echoed][server_guid][magic][len:u16 BE][id_string]`.
///
/// The id string is the semicolon-separated MCPE tuple; clients tolerate a
/// trailing separator and some require it.
pub fn build_unconnected_pong(client_time: i64, info: &PongInfo<'_>) -> Vec<u8> {
    let motd = strip_colour_codes(info.motd);
    let id_string = format!(
        "MCPE;{};{};{};{};{};{};{};Survival;1;{};{};",
        motd,
        info.protocol_version,
        info.version_name,
        info.players_online,
        info.max_players,
        info.server_guid,
        motd,
        info.port_v4,
        info.port_v6,
    );

    let mut out = Vec::with_capacity(35 + id_string.len());
    out.push(ID_UNCONNECTED_PONG);
    out.extend_from_slice(&client_time.to_be_bytes());
    out.extend_from_slice(&info.server_guid.to_be_bytes());
    out.extend_from_slice(&OFFLINE_MAGIC);
    out.extend_from_slice(&(id_string.len() as u16).to_be_bytes());
    out.extend_from_slice(id_string.as_bytes());
    out
}

/// Strip `§x` formatting sequences; semicolons would corrupt the MCPE tuple
/// so they are dropped too.
pub fn strip_colour_codes(motd: &str) -> String {
    let mut out = String::with_capacity(motd.len());
    let mut chars = motd.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '§' => {
                chars.next();
            }
            ';' => {}
            _ => out.push(ch),
        }
    }
    out
}
