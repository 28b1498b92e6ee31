use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;

const ENCODING: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// Mint a 26-character Crockford-base32 id: 48 bits of unix milliseconds
/// followed by 80 random bits. Ids minted later sort lexicographically later.
pub fn new() -> String {
	let millis = SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or_default()
		.as_millis() as u64;
	let mut entropy = [0u8; 10];
	rand::rng().fill_bytes(&mut entropy);
	encode(millis, &entropy)
}

fn encode(millis: u64, entropy: &[u8; 10]) -> String {
	// 128-bit value: 48-bit timestamp in the high bits, entropy below.
	let mut value: u128 = (millis as u128 & 0xFFFF_FFFF_FFFF) << 80;
	for (i, b) in entropy.iter().enumerate() {
		value |= (*b as u128) << (72 - 8 * i);
	}
	let mut out = [0u8; 26];
	for i in (0..26).rev() {
		out[i] = ENCODING[(value & 0x1F) as usize];
		value >>= 5;
	}
	String::from_utf8(out.to_vec()).expect("base32 output is ascii")
}
