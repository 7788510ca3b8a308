//! A strict subset of MessagePack: just enough to carry the frame shapes in
//! `protocol.rs`. Grounded on the trait-per-wire-type
//! shape of `open-sourceress-myway/src/protocol/{args,event}.rs`'s
//! `DecodeArg`/`EncodeArg`, and on the tag-byte range matches in
//! `DataDog-libdatadog`'s `msgpack_decoder`/`msgpack_encoder` modules for the
//! wire format itself.
use crate::cursor::Cursor;
use crate::logging::fatal;

mod tag {
	pub const NIL: u8 = 0xc0;
	pub const FIXARRAY_BASE: u8 = 0x90;
	pub const FIXARRAY_MAX: u8 = 0x9f;
	pub const ARRAY16: u8 = 0xdc;
	pub const FIXSTR_BASE: u8 = 0xa0;
	pub const FIXSTR_MAX: u8 = 0xbf;
	pub const STR8: u8 = 0xd9;
	pub const STR16: u8 = 0xda;
	pub const STR32: u8 = 0xdb;
	pub const BIN8: u8 = 0xc4;
	pub const BIN32: u8 = 0xc6;
	pub const UINT8: u8 = 0xcc;
	pub const UINT16: u8 = 0xcd;
	pub const UINT32: u8 = 0xce;
	pub const UINT64: u8 = 0xcf;
	pub const FIXINT_MAX: u8 = 0x7f;
}

/// Anything the encoder can append raw bytes to. Implemented for both the
/// shared ring [`crate::buffer::Buffer`] (frame emission during normal
/// operation) and a plain `Vec<u8>` (the log sink's private, synchronously
/// flushed message — see `logging.rs`).
pub trait Sink {
	fn push_byte(&mut self, byte: u8);
	fn push_bytes(&mut self, bytes: &[u8]);
}

impl Sink for crate::buffer::Buffer {
	fn push_byte(&mut self, byte: u8) {
		self.push(byte);
	}

	fn push_bytes(&mut self, bytes: &[u8]) {
		self.enqueue(bytes);
	}
}

impl Sink for Vec<u8> {
	fn push_byte(&mut self, byte: u8) {
		self.push(byte);
	}

	fn push_bytes(&mut self, bytes: &[u8]) {
		self.extend_from_slice(bytes);
	}
}

/// Encode `n` using the shortest form that fits, escalating fixint → uint8 →
/// uint16 → uint32 → uint64.
pub fn encode_uint(sink: &mut impl Sink, n: u64) {
	if n <= tag::FIXINT_MAX as u64 {
		sink.push_byte(n as u8);
	} else if n <= u8::MAX as u64 {
		sink.push_byte(tag::UINT8);
		sink.push_byte(n as u8);
	} else if n <= u16::MAX as u64 {
		sink.push_byte(tag::UINT16);
		sink.push_bytes(&(n as u16).to_be_bytes());
	} else if n <= u32::MAX as u64 {
		sink.push_byte(tag::UINT32);
		sink.push_bytes(&(n as u32).to_be_bytes());
	} else {
		sink.push_byte(tag::UINT64);
		sink.push_bytes(&n.to_be_bytes());
	}
}

pub fn encode_nil(sink: &mut impl Sink) {
	sink.push_byte(tag::NIL);
}

pub fn encode_array_len(sink: &mut impl Sink, len: usize) {
	if len <= 15 {
		sink.push_byte(tag::FIXARRAY_BASE + len as u8);
	} else {
		assert!(len <= u16::MAX as usize, "array too long to encode: {len}");
		sink.push_byte(tag::ARRAY16);
		sink.push_bytes(&(len as u16).to_be_bytes());
	}
}

pub fn encode_str(sink: &mut impl Sink, s: &str) {
	encode_str_bytes(sink, s.as_bytes());
}

/// Encode a `str` header plus `bytes` verbatim, without requiring `bytes` to
/// be valid UTF-8. Used to forward child output unchanged instead of
/// substituting U+FFFD for bytes the child never promised were text,
/// matching `ltx.c:744-747`'s raw byte forwarding.
pub fn encode_str_bytes(sink: &mut impl Sink, bytes: &[u8]) {
	let len = bytes.len();
	if len <= 31 {
		sink.push_byte(tag::FIXSTR_BASE + len as u8);
	} else if len <= u8::MAX as usize {
		sink.push_byte(tag::STR8);
		sink.push_byte(len as u8);
	} else if len <= u16::MAX as usize {
		sink.push_byte(tag::STR16);
		sink.push_bytes(&(len as u16).to_be_bytes());
	} else {
		assert!(len <= u32::MAX as usize, "string too long to encode: {len}");
		sink.push_byte(tag::STR32);
		sink.push_bytes(&(len as u32).to_be_bytes());
	}
	sink.push_bytes(bytes);
}

/// Encode a binary header *and* payload. `get_file` instead uses
/// [`encode_bin_header`] alone, since its payload is streamed separately via
/// `sendfile` (see `file_transfer.rs`).
pub fn encode_bin(sink: &mut impl Sink, bytes: &[u8]) {
	encode_bin_header(sink, bytes.len() as u64);
	sink.push_bytes(bytes);
}

/// Encode just a `bin` header declaring `len` bytes will follow. This always
/// escalates straight to `bin32` once a value no longer fits in a `bin8`
/// header, rather than reproducing `ltx.c`'s `str8`-for-large-binaries quirk.
pub fn encode_bin_header(sink: &mut impl Sink, len: u64) {
	if len < 256 {
		sink.push_byte(tag::BIN8);
		sink.push_byte(len as u8);
	} else {
		assert!(len <= u32::MAX as u64, "binary payload too long to encode: {len}");
		sink.push_byte(tag::BIN32);
		sink.push_bytes(&(len as u32).to_be_bytes());
	}
}

/// Decode an array-length header. Any tag outside the fixarray/array16 family
/// is a protocol violation: every frame starts with an outer array, so a
/// mismatch here means the driver is not speaking our protocol.
pub fn decode_array_len(cur: &mut Cursor<'_>) -> Option<usize> {
	let tag = cur.shift()?;
	match tag {
		tag::FIXARRAY_BASE..=tag::FIXARRAY_MAX => Some((tag - tag::FIXARRAY_BASE) as usize),
		tag::ARRAY16 => {
			let bytes = cur.take(2)?;
			Some(u16::from_be_bytes([bytes[0], bytes[1]]) as usize)
		},
		other => fatal!("message should start with fixarray, not {other:#x}"),
	}
}

pub fn decode_uint(cur: &mut Cursor<'_>) -> Option<u64> {
	let tag = cur.shift()?;
	match tag {
		0x00..=tag::FIXINT_MAX => Some(tag as u64),
		tag::UINT8 => cur.take(1).map(|b| b[0] as u64),
		tag::UINT16 => cur.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]) as u64),
		tag::UINT32 => cur.take(4).map(|b| u32::from_be_bytes(b.try_into().unwrap()) as u64),
		tag::UINT64 => cur.take(8).map(|b| u64::from_be_bytes(b.try_into().unwrap())),
		other => fatal!("not a uint tag: {other:#x}"),
	}
}

/// Decode a `uint` or `nil` (used for the `log` frame's optional table_id).
pub fn decode_uint_or_nil(cur: &mut Cursor<'_>) -> Option<Option<u64>> {
	match cur.peek()? {
		tag::NIL => {
			cur.shift();
			Some(None)
		},
		_ => decode_uint(cur).map(Some),
	}
}

pub fn decode_str<'a>(cur: &mut Cursor<'a>) -> Option<&'a str> {
	let tag = cur.shift()?;
	let len = match tag {
		tag::FIXSTR_BASE..=tag::FIXSTR_MAX => (tag - tag::FIXSTR_BASE) as usize,
		tag::STR8 => cur.take(1)?[0] as usize,
		tag::STR16 => {
			let bytes = cur.take(2)?;
			u16::from_be_bytes([bytes[0], bytes[1]]) as usize
		},
		tag::STR32 => {
			let bytes = cur.take(4)?;
			u32::from_be_bytes(bytes.try_into().unwrap()) as usize
		},
		other => fatal!("not a string tag: {other:#x}"),
	};
	let bytes = cur.take(len)?;
	match std::str::from_utf8(bytes) {
		Ok(s) => Some(s),
		Err(_) => fatal!("string argument is not valid utf-8"),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn roundtrip_uint(n: u64) -> u64 {
		let mut buf = Vec::new();
		encode_uint(&mut buf, n);
		let mut cur = Cursor::new(&buf);
		decode_uint(&mut cur).unwrap()
	}

	#[test]
	fn uint_roundtrips_across_all_size_classes() {
		for n in [0u64, 1, 0x7f, 0x80, 0xff, 0x100, 0xffff, 0x10000, 0xffff_ffff, 0x1_0000_0000, u64::MAX] {
			assert_eq!(roundtrip_uint(n), n, "failed for {n:#x}");
		}
	}

	#[test]
	fn uint_picks_shortest_form() {
		let mut buf = Vec::new();
		encode_uint(&mut buf, 5);
		assert_eq!(buf, vec![5]);

		let mut buf = Vec::new();
		encode_uint(&mut buf, 200);
		assert_eq!(buf, vec![tag::UINT8, 200]);

		let mut buf = Vec::new();
		encode_uint(&mut buf, 70000);
		assert_eq!(buf[0], tag::UINT32);
	}

	#[test]
	fn str_roundtrips_including_empty_and_long() {
		for s in ["", "hi", &"x".repeat(31), &"x".repeat(32), &"x".repeat(300)] {
			let mut buf = Vec::new();
			encode_str(&mut buf, s);
			let mut cur = Cursor::new(&buf);
			assert_eq!(decode_str(&mut cur).unwrap(), s);
			assert_eq!(cur.remaining(), 0);
		}
	}

	#[test]
	fn decode_str_reports_insufficient_data_without_consuming_on_split_header() {
		let mut buf = Vec::new();
		encode_str(&mut buf, "hello world");
		// Truncate mid-payload: header says 11 bytes follow, but only 3 are present.
		let truncated = &buf[..buf.len() - 8];
		let mut cur = Cursor::new(truncated);
		assert_eq!(decode_str(&mut cur), None);
	}

	#[test]
	fn array_len_roundtrips_fixarray_and_array16() {
		for len in [0usize, 1, 15, 16, 65535] {
			let mut buf = Vec::new();
			encode_array_len(&mut buf, len);
			let mut cur = Cursor::new(&buf);
			assert_eq!(decode_array_len(&mut cur), Some(len));
		}
	}

	#[test]
	fn bin_header_escalates_to_bin32_at_256_bytes() {
		let mut buf = Vec::new();
		encode_bin_header(&mut buf, 255);
		assert_eq!(buf[0], tag::BIN8);

		let mut buf = Vec::new();
		encode_bin_header(&mut buf, 256);
		assert_eq!(buf[0], tag::BIN32);
	}

	#[test]
	fn uint_or_nil_decodes_both_variants() {
		let mut buf = Vec::new();
		encode_nil(&mut buf);
		let mut cur = Cursor::new(&buf);
		assert_eq!(decode_uint_or_nil(&mut cur), Some(None));

		let mut buf = Vec::new();
		encode_uint(&mut buf, 42);
		let mut cur = Cursor::new(&buf);
		assert_eq!(decode_uint_or_nil(&mut cur), Some(Some(42)));
	}
}
