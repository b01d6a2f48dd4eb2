//! Protocol constants and datacenter addresses

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::LazyLock;

// ============= Telegram Datacenters =============

pub const TG_DATACENTER_PORT: u16 = 443;

pub static TG_DATACENTERS_V4: LazyLock<Vec<IpAddr>> = LazyLock::new(|| {
    vec![
        IpAddr::V4(Ipv4Addr::new(149, 154, 175, 50)),
        IpAddr::V4(Ipv4Addr::new(149, 154, 167, 51)),
        IpAddr::V4(Ipv4Addr::new(149, 154, 175, 100)),
        IpAddr::V4(Ipv4Addr::new(149, 154, 167, 91)),
        IpAddr::V4(Ipv4Addr::new(149, 154, 171, 5)),
    ]
});

pub static TG_DATACENTERS_V6: LazyLock<Vec<IpAddr>> = LazyLock::new(|| {
    vec![
        IpAddr::V6(Ipv6Addr::new(0x2001, 0x0b28, 0xf23d, 0xf001, 0, 0, 0, 0xa)),
        IpAddr::V6(Ipv6Addr::new(0x2001, 0x067c, 0x04e8, 0xf002, 0, 0, 0, 0xa)),
        IpAddr::V6(Ipv6Addr::new(0x2001, 0x0b28, 0xf23d, 0xf003, 0, 0, 0, 0xa)),
        IpAddr::V6(Ipv6Addr::new(0x2001, 0x067c, 0x04e8, 0xf004, 0, 0, 0, 0xa)),
        IpAddr::V6(Ipv6Addr::new(0x2001, 0x0b28, 0xf23f, 0xf005, 0, 0, 0, 0xa)),
    ]
});

// ============= Middle-End Proxies =============

pub const ME_PROXY_PORT: u16 = 8888;

/// Middle-end endpoints per signed DC index (negative = media).
pub static TG_MIDDLE_PROXIES_V4: LazyLock<HashMap<i16, Vec<(IpAddr, u16)>>> =
    LazyLock::new(|| {
        let v4 = |a, b, c, d| (IpAddr::V4(Ipv4Addr::new(a, b, c, d)), ME_PROXY_PORT);
        let mut m = HashMap::new();
        m.insert(1, vec![v4(149, 154, 175, 50)]);
        m.insert(-1, vec![v4(149, 154, 175, 50)]);
        m.insert(2, vec![v4(149, 154, 161, 144)]);
        m.insert(-2, vec![v4(149, 154, 161, 144)]);
        m.insert(3, vec![v4(149, 154, 175, 100)]);
        m.insert(-3, vec![v4(149, 154, 175, 100)]);
        m.insert(4, vec![v4(91, 108, 4, 136)]);
        m.insert(-4, vec![v4(149, 154, 165, 109)]);
        m.insert(5, vec![v4(91, 108, 56, 183)]);
        m.insert(-5, vec![v4(91, 108, 56, 183)]);
        m
    });

pub static TG_MIDDLE_PROXIES_V6: LazyLock<HashMap<i16, Vec<(IpAddr, u16)>>> =
    LazyLock::new(|| {
        let v6 = |b, c, d, port| {
            (IpAddr::V6(Ipv6Addr::new(0x2001, b, c, d, 0, 0, 0, 0xd)), port)
        };
        let table = [
            (1, v6(0x0b28, 0xf23d, 0xf001, ME_PROXY_PORT)),
            (2, v6(0x067c, 0x04e8, 0xf002, 80)),
            (3, v6(0x0b28, 0xf23d, 0xf003, ME_PROXY_PORT)),
            (4, v6(0x067c, 0x04e8, 0xf004, ME_PROXY_PORT)),
            (5, v6(0x0b28, 0xf23f, 0xf005, ME_PROXY_PORT)),
        ];
        let mut m = HashMap::new();
        for (dc, addr) in table {
            m.insert(dc, vec![addr]);
            m.insert(-dc, vec![addr]);
        }
        m
    });

// ============= Protocol Tags =============

/// MTProto transport framing variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ProtoTag {
    /// 1-byte length prefix in 4-byte words
    Abridged = 0xefefefef,
    /// 4-byte length prefix
    Intermediate = 0xeeeeeeee,
    /// Intermediate with random tail padding
    Secure = 0xdddddddd,
}

impl ProtoTag {
    pub fn from_bytes(bytes: [u8; 4]) -> Option<Self> {
        match bytes {
            PROTO_TAG_ABRIDGED => Some(ProtoTag::Abridged),
            PROTO_TAG_INTERMEDIATE => Some(ProtoTag::Intermediate),
            PROTO_TAG_SECURE => Some(ProtoTag::Secure),
            _ => None,
        }
    }

    pub fn to_bytes(self) -> [u8; 4] {
        (self as u32).to_le_bytes()
    }

    pub fn name(self) -> &'static str {
        match self {
            ProtoTag::Abridged => "abridged",
            ProtoTag::Intermediate => "intermediate",
            ProtoTag::Secure => "secure",
        }
    }
}

pub const PROTO_TAG_ABRIDGED: [u8; 4] = [0xef, 0xef, 0xef, 0xef];
pub const PROTO_TAG_INTERMEDIATE: [u8; 4] = [0xee, 0xee, 0xee, 0xee];
pub const PROTO_TAG_SECURE: [u8; 4] = [0xdd, 0xdd, 0xdd, 0xdd];

// ============= Handshake Layout =============

/// Random prefix that carries no key material
pub const SKIP_LEN: usize = 8;
pub const PREKEY_LEN: usize = 32;
pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 16;
pub const HANDSHAKE_LEN: usize = 64;
pub const PROTO_TAG_POS: usize = 56;
pub const DC_IDX_POS: usize = 60;

/// User secret length (without the `dd` prefix)
pub const SECRET_LEN: usize = 16;

// ============= Message Limits =============

pub const MIN_MSG_LEN: usize = 12;
/// 16 MiB
pub const MAX_MSG_LEN: usize = 1 << 24;
pub const CBC_PADDING: usize = 16;
pub const PADDING_FILLER: [u8; 4] = [0x04, 0x00, 0x00, 0x00];

/// Abridged: first byte values
pub const ABRIDGED_LONG_MARKER: u8 = 0x7f;
pub const ABRIDGED_QUICKACK_BIT: u8 = 0x80;
/// Intermediate/secure: high bit of the length word
pub const INTERMEDIATE_QUICKACK_BIT: u32 = 0x8000_0000;

// ============= Timeouts =============

pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_RELAY_IDLE_SECS: u64 = 120;
pub const DEFAULT_ME_RESPONSE_SECS: u64 = 120;
pub const DEFAULT_KEEPALIVE_SECS: u64 = 60;
pub const DEFAULT_ACK_TIMEOUT_SECS: u64 = 300;

pub const ME_CONNECT_TIMEOUT_SECS: u64 = 5;
pub const ME_HANDSHAKE_TIMEOUT_SECS: u64 = 10;

// ============= Buffer Sizes =============

pub const DEFAULT_BUFFER_SIZE: usize = 16384;

// ============= Reserved Nonce Patterns =============

pub static RESERVED_NONCE_FIRST_BYTES: &[u8] = &[0xef];

pub static RESERVED_NONCE_BEGINNINGS: &[[u8; 4]] = &[
    [0x48, 0x45, 0x41, 0x44], // HEAD
    [0x50, 0x4f, 0x53, 0x54], // POST
    [0x47, 0x45, 0x54, 0x20], // GET
    [0x4f, 0x50, 0x54, 0x49], // OPTI
    [0xee, 0xee, 0xee, 0xee], // intermediate
    [0xdd, 0xdd, 0xdd, 0xdd], // secure
    [0x16, 0x03, 0x01, 0x02], // TLS
];

pub static RESERVED_NONCE_CONTINUES: &[[u8; 4]] = &[[0x00, 0x00, 0x00, 0x00]];

// ============= RPC Constants (u32, little-endian on the wire) =============

pub const RPC_NONCE_U32: u32 = 0x7acb87aa;
pub const RPC_HANDSHAKE_U32: u32 = 0x7682eef5;
pub const RPC_HANDSHAKE_ERROR_U32: u32 = 0x6a27beda;
pub const TL_PROXY_TAG_U32: u32 = 0xdb1e26ae;

pub const RPC_PROXY_REQ_U32: u32 = 0x36cef1ee;
pub const RPC_PROXY_ANS_U32: u32 = 0x4403da0d;
pub const RPC_CLOSE_CONN_U32: u32 = 0x1fcf425d;
pub const RPC_CLOSE_EXT_U32: u32 = 0x5eb634a2;
pub const RPC_SIMPLE_ACK_U32: u32 = 0x3bac409b;
pub const RPC_PING_U32: u32 = 0x5730a2df;
pub const RPC_PONG_U32: u32 = 0x8430eaa7;

pub const RPC_CRYPTO_AES_U32: u32 = 1;

/// Sequence numbers of the two handshake frames
pub const RPC_SEQ_NONCE: i32 = -2;
pub const RPC_SEQ_HANDSHAKE: i32 = -1;

/// Process ids exchanged in the RPC handshake
pub const RPC_HANDSHAKE_PID: &[u8; 12] = b"IPIPPRPDTIME";

pub const RPC_FLAG_NOT_ENCRYPTED: u32 = 0x2;
pub const RPC_FLAG_HAS_AD_TAG: u32 = 0x8;
pub const RPC_FLAG_MAGIC: u32 = 0x1000;
pub const RPC_FLAG_EXTMODE2: u32 = 0x20000;
pub const RPC_FLAG_PAD: u32 = 0x8000000;
pub const RPC_FLAG_INTERMEDIATE: u32 = 0x20000000;
pub const RPC_FLAG_ABRIDGED: u32 = 0x40000000;
pub const RPC_FLAG_QUICKACK: u32 = 0x80000000;

/// Ad-tag length in bytes
pub const AD_TAG_LEN: usize = 16;
