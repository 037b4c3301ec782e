//! Wire-level types shared by both IPC backends: the handshake identifier,
//! `ForkserverConfig`, and the single-byte command/status enums.
//!
//! Everything here is `#[repr]`-free plain data with explicit byte-level
//! (de)serialization, since the layout is a cross-language contract with the
//! fuzzer rather than something `#[repr(C)]` alone could pin down safely
//! (the fuzzer may not even be written in Rust).

/// `0xDEAD0000 | (VERSION << 8) | mode`, sent little-endian as the first 4
/// bytes after attach.
pub const HANDSHAKE_MAGIC: u32 = 0xDEAD_0000;
pub const HANDSHAKE_VERSION: u32 = 0x01;

/// Size in bytes of the exit-code bitmap (256 exit codes / 8 bits per byte).
pub const EXIT_CODES_LEN: usize = 32;

/// Wire size of [`ForkserverConfig`]: two `i32`s plus the bitmap.
pub const CONFIG_WIRE_LEN: usize = 4 + 4 + EXIT_CODES_LEN;

/// Which mode the target is handshaking as. Carried in the low byte of the
/// handshake identifier.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum Mode {
	Forkserver = 1,
	Persistent = 2,
}

impl Mode {
	pub fn handshake_ident(self) -> u32 {
		HANDSHAKE_MAGIC | (HANDSHAKE_VERSION << 8) | (self as u32)
	}
}

/// Fuzzer-supplied, per-session configuration. Fixed 40-byte wire format.
#[derive(Clone, Copy, Debug)]
pub struct ForkserverConfig {
	/// Milliseconds before a running child is considered hung. `0` disables
	/// the timeout entirely.
	pub timeout_ms: i32,
	/// Signal sent to a timed-out child on the first (soft) kill attempt.
	pub signal: i32,
	/// Bitmap over exit codes 0..=255; a set bit reclassifies a clean exit
	/// with that code as a crash (used for e.g. sanitizer abort codes).
	pub exit_codes: [u8; EXIT_CODES_LEN],
}

impl ForkserverConfig {
	pub fn from_bytes(buf: &[u8; CONFIG_WIRE_LEN]) -> Self {
		let timeout_ms = i32::from_ne_bytes(buf[0..4].try_into().unwrap());
		let signal = i32::from_ne_bytes(buf[4..8].try_into().unwrap());
		let mut exit_codes = [0u8; EXIT_CODES_LEN];
		exit_codes.copy_from_slice(&buf[8..8 + EXIT_CODES_LEN]);
		ForkserverConfig {
			timeout_ms,
			signal,
			exit_codes,
		}
	}

	pub fn to_bytes(self) -> [u8; CONFIG_WIRE_LEN] {
		let mut buf = [0u8; CONFIG_WIRE_LEN];
		buf[0..4].copy_from_slice(&self.timeout_ms.to_ne_bytes());
		buf[4..8].copy_from_slice(&self.signal.to_ne_bytes());
		buf[8..8 + EXIT_CODES_LEN].copy_from_slice(&self.exit_codes);
		buf
	}

	/// Is exit code `code` reclassified as a crash?
	pub fn exit_code_is_crash(&self, code: u8) -> bool {
		let byte = self.exit_codes[(code / 8) as usize];
		byte & (1 << (code % 8)) != 0
	}
}

/// Single status byte the target reports per run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ForkserverStatus {
	Exit = 0,
	Crash = 1,
	Timeout = 2,
}

/// Single command byte the fuzzer sends per run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ForkserverCommand {
	Run = 0,
	Stop = 1,
}

impl ForkserverCommand {
	pub fn from_byte(byte: u8) -> Option<Self> {
		match byte {
			0 => Some(ForkserverCommand::Run),
			1 => Some(ForkserverCommand::Stop),
			_ => None,
		}
	}
}
