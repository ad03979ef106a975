//! Client message ids.
//!
//! Every outgoing chat message carries a client-chosen `msgId` the server
//! echoes back, so ids from one device must not repeat. A generator is
//! seeded once and owned by whoever sends messages.

/// Largest id handed out before the sequence restarts at 1
pub const MAX_MESSAGE_ID: i64 = i32::MAX as i64;

/// Sequence of client message ids
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageIdGenerator {
    seed: u64,
    last: i64,
}

fn mix(seed: u64) -> u64 {
    // splitmix64 finalizer
    let mut z = seed.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

impl MessageIdGenerator {
    /// Generator whose sequence starts at a point derived from `seed`
    pub fn new(seed: u64) -> Self {
        // Leave headroom so a fresh sequence does not wrap immediately
        let start = (mix(seed) % (MAX_MESSAGE_ID as u64 / 2)) as i64;
        Self { seed, last: start }
    }

    /// Generator seeded from a device identifier
    pub fn from_device(device_uuid: &str) -> Self {
        // FNV-1a
        let seed = device_uuid
            .bytes()
            .fold(0xcbf2_9ce4_8422_2325u64, |hash, byte| {
                (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3)
            });
        Self::new(seed)
    }

    /// Generator with a random seed
    pub fn random() -> Self {
        Self::new(rand::random())
    }

    /// Seed the sequence was built from
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Next id, always in `1..=MAX_MESSAGE_ID`
    pub fn next_id(&mut self) -> i64 {
        self.last = if self.last >= MAX_MESSAGE_ID {
            1
        } else {
            self.last + 1
        };
        self.last
    }
}
