//! Table-based header compression, maintained symmetrically on each peer.
//!
//! Both sides keep a 61-entry static table and a bounded dynamic table;
//! the encoder inserts indexable headers, the decoder mirrors every
//! insertion, and SETTINGS advertise the dynamic-table ceiling. Sensitive
//! headers are emitted never-indexed so intermediaries do not retain them.

use std::collections::VecDeque;

use bytes::{BufMut, Bytes, BytesMut};

use super::huffman;
use super::H2Error;

pub(crate) const DEFAULT_TABLE_SIZE: u32 = 4_096;

/// Per-entry overhead charged against the dynamic-table size.
const ENTRY_OVERHEAD: usize = 32;

const STATIC_TABLE: [(&str, &str); 61] = [
    (":authority", ""),
    (":method", "GET"),
    (":method", "POST"),
    (":path", "/"),
    (":path", "/index.html"),
    (":scheme", "http"),
    (":scheme", "https"),
    (":status", "200"),
    (":status", "204"),
    (":status", "206"),
    (":status", "304"),
    (":status", "400"),
    (":status", "404"),
    (":status", "500"),
    ("accept-charset", ""),
    ("accept-encoding", "gzip, deflate"),
    ("accept-language", ""),
    ("accept-ranges", ""),
    ("accept", ""),
    ("access-control-allow-origin", ""),
    ("age", ""),
    ("allow", ""),
    ("authorization", ""),
    ("cache-control", ""),
    ("content-disposition", ""),
    ("content-encoding", ""),
    ("content-language", ""),
    ("content-length", ""),
    ("content-location", ""),
    ("content-range", ""),
    ("content-type", ""),
    ("cookie", ""),
    ("date", ""),
    ("etag", ""),
    ("expect", ""),
    ("expires", ""),
    ("from", ""),
    ("host", ""),
    ("if-match", ""),
    ("if-modified-since", ""),
    ("if-none-match", ""),
    ("if-range", ""),
    ("if-unmodified-since", ""),
    ("last-modified", ""),
    ("link", ""),
    ("location", ""),
    ("max-forwards", ""),
    ("proxy-authenticate", ""),
    ("proxy-authorization", ""),
    ("range", ""),
    ("referer", ""),
    ("refresh", ""),
    ("retry-after", ""),
    ("server", ""),
    ("set-cookie", ""),
    ("strict-transport-security", ""),
    ("transfer-encoding", ""),
    ("user-agent", ""),
    ("vary", ""),
    ("via", ""),
    ("www-authenticate", ""),
];

/// A header as the compression layer sees it: a lowercase name and a value.
#[derive(Clone, PartialEq, Eq)]
pub(crate) struct Header {
    pub name: Bytes,
    pub value: Bytes,
}

impl Header {
    pub(crate) fn new(name: &str, value: &str) -> Header {
        Header {
            name: Bytes::from(name.to_ascii_lowercase()),
            value: Bytes::copy_from_slice(value.as_bytes()),
        }
    }

    pub(crate) fn from_bytes(name: Bytes, value: Bytes) -> Header {
        Header { name, value }
    }

    fn size(&self) -> usize {
        self.name.len() + self.value.len() + ENTRY_OVERHEAD
    }

    fn is_sensitive(&self) -> bool {
        matches!(
            &self.name[..],
            b"authorization" | b"proxy-authorization" | b"cookie" | b"set-cookie"
        )
    }
}

impl std::fmt::Debug for Header {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {}",
            String::from_utf8_lossy(&self.name),
            String::from_utf8_lossy(&self.value)
        )
    }
}

#[derive(Default)]
struct DynamicTable {
    // Front is the most recently inserted entry (lowest dynamic index).
    entries: VecDeque<Header>,
    size: usize,
    max_size: usize,
}

impl DynamicTable {
    fn with_max_size(max_size: usize) -> DynamicTable {
        DynamicTable {
            entries: VecDeque::new(),
            size: 0,
            max_size,
        }
    }

    fn insert(&mut self, header: Header) {
        let size = header.size();
        if size > self.max_size {
            // An entry larger than the table empties it.
            self.entries.clear();
            self.size = 0;
            return;
        }
        while self.size + size > self.max_size {
            let evicted = self.entries.pop_back().expect("size accounting");
            self.size -= evicted.size();
        }
        self.size += size;
        self.entries.push_front(header);
    }

    fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
        while self.size > self.max_size {
            let evicted = self.entries.pop_back().expect("size accounting");
            self.size -= evicted.size();
        }
    }

    fn get(&self, index: usize) -> Option<&Header> {
        self.entries.get(index)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Resolve an absolute index (1-based) across the static then dynamic
/// tables.
fn lookup(table: &DynamicTable, index: usize) -> Result<Header, H2Error> {
    if index == 0 {
        return Err(H2Error::Compression);
    }
    if index <= STATIC_TABLE.len() {
        let (name, value) = STATIC_TABLE[index - 1];
        return Ok(Header::new(name, value));
    }
    table
        .get(index - STATIC_TABLE.len() - 1)
        .cloned()
        .ok_or(H2Error::Compression)
}

// ===== integers and strings =====

fn encode_int(value: usize, prefix_bits: u8, flags: u8, out: &mut BytesMut) {
    let limit = (1usize << prefix_bits) - 1;
    if value < limit {
        out.put_u8(flags | value as u8);
        return;
    }
    out.put_u8(flags | limit as u8);
    let mut value = value - limit;
    while value >= 128 {
        out.put_u8((value % 128 + 128) as u8);
        value /= 128;
    }
    out.put_u8(value as u8);
}

fn decode_int(buf: &[u8], pos: &mut usize, prefix_bits: u8) -> Result<usize, H2Error> {
    let limit = (1usize << prefix_bits) - 1;
    let first = *buf.get(*pos).ok_or(H2Error::Compression)? as usize & limit;
    *pos += 1;
    if first < limit {
        return Ok(first);
    }
    let mut value = limit;
    let mut shift = 0u32;
    loop {
        let byte = *buf.get(*pos).ok_or(H2Error::Compression)? as usize;
        *pos += 1;
        value += (byte & 0x7f)
            .checked_shl(shift)
            .ok_or(H2Error::Compression)?;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > 28 {
            return Err(H2Error::Compression);
        }
    }
}

fn encode_str(data: &[u8], out: &mut BytesMut) {
    let huffman_len = huffman::encoded_len(data);
    if huffman_len < data.len() {
        encode_int(huffman_len, 7, 0x80, out);
        huffman::encode(data, out);
    } else {
        encode_int(data.len(), 7, 0, out);
        out.put_slice(data);
    }
}

fn decode_str(buf: &[u8], pos: &mut usize) -> Result<Bytes, H2Error> {
    let huffman = buf.get(*pos).ok_or(H2Error::Compression)? & 0x80 != 0;
    let len = decode_int(buf, pos, 7)?;
    let end = pos.checked_add(len).ok_or(H2Error::Compression)?;
    let raw = buf.get(*pos..end).ok_or(H2Error::Compression)?;
    *pos = end;
    if huffman {
        Ok(Bytes::from(huffman::decode(raw)?))
    } else {
        Ok(Bytes::copy_from_slice(raw))
    }
}

// ===== encoder =====

/// The sending half of the codec. Lives under the connection's writer lock.
pub(crate) struct Encoder {
    table: DynamicTable,
    pending_resize: Option<usize>,
}

impl Encoder {
    pub(crate) fn new() -> Encoder {
        Encoder {
            table: DynamicTable::with_max_size(DEFAULT_TABLE_SIZE as usize),
            pending_resize: None,
        }
    }

    /// Honor the peer's advertised `HEADER_TABLE_SIZE`. Takes effect at the
    /// start of the next header block, as a table-size update.
    pub(crate) fn set_max_table_size(&mut self, size: usize) {
        if size != self.table.max_size {
            self.pending_resize = Some(size);
        }
    }

    pub(crate) fn encode(&mut self, headers: &[Header]) -> BytesMut {
        let mut out = BytesMut::with_capacity(64);
        if let Some(size) = self.pending_resize.take() {
            self.table.set_max_size(size);
            encode_int(size, 5, 0x20, &mut out);
        }
        for header in headers {
            self.encode_one(header, &mut out);
        }
        out
    }

    fn encode_one(&mut self, header: &Header, out: &mut BytesMut) {
        let (full_index, name_index) = self.search(header);

        if let Some(index) = full_index {
            encode_int(index, 7, 0x80, out);
            return;
        }

        if header.is_sensitive() {
            // Literal never indexed.
            match name_index {
                Some(index) => encode_int(index, 4, 0x10, out),
                None => {
                    out.put_u8(0x10);
                    encode_str(&header.name, out);
                }
            }
            encode_str(&header.value, out);
            return;
        }

        // Literal with incremental indexing.
        match name_index {
            Some(index) => encode_int(index, 6, 0x40, out),
            None => {
                out.put_u8(0x40);
                encode_str(&header.name, out);
            }
        }
        encode_str(&header.value, out);
        self.table.insert(header.clone());
    }

    fn search(&self, header: &Header) -> (Option<usize>, Option<usize>) {
        let mut name_index = None;
        for (i, (name, value)) in STATIC_TABLE.iter().enumerate() {
            if name.as_bytes() == header.name {
                if value.as_bytes() == header.value {
                    return (Some(i + 1), None);
                }
                if name_index.is_none() {
                    name_index = Some(i + 1);
                }
            }
        }
        for i in 0..self.table.len() {
            let entry = self.table.get(i).expect("in range");
            if entry.name == header.name {
                let index = STATIC_TABLE.len() + i + 1;
                if entry.value == header.value {
                    return (Some(index), None);
                }
                if name_index.is_none() {
                    name_index = Some(index);
                }
            }
        }
        (None, name_index)
    }
}

// ===== decoder =====

/// The receiving half of the codec. Lives on the connection's reader task.
pub(crate) struct Decoder {
    table: DynamicTable,
    // The ceiling we advertised in SETTINGS; resize updates above it are a
    // compression error.
    max_allowed: usize,
}

impl Decoder {
    pub(crate) fn new() -> Decoder {
        Decoder {
            table: DynamicTable::with_max_size(DEFAULT_TABLE_SIZE as usize),
            max_allowed: DEFAULT_TABLE_SIZE as usize,
        }
    }

    pub(crate) fn decode(&mut self, block: &[u8]) -> Result<Vec<Header>, H2Error> {
        let mut headers = Vec::new();
        let mut pos = 0;
        while pos < block.len() {
            let byte = block[pos];
            if byte & 0x80 != 0 {
                // Indexed header field.
                let index = decode_int(block, &mut pos, 7)?;
                headers.push(lookup(&self.table, index)?);
            } else if byte & 0x40 != 0 {
                // Literal with incremental indexing.
                let header = self.decode_literal(block, &mut pos, 6)?;
                self.table.insert(header.clone());
                headers.push(header);
            } else if byte & 0x20 != 0 {
                // Dynamic table size update.
                let size = decode_int(block, &mut pos, 5)?;
                if size > self.max_allowed {
                    return Err(H2Error::Compression);
                }
                self.table.set_max_size(size);
            } else {
                // Literal without indexing (0000) or never indexed (0001).
                let header = self.decode_literal(block, &mut pos, 4)?;
                headers.push(header);
            }
        }
        Ok(headers)
    }

    fn decode_literal(
        &mut self,
        block: &[u8],
        pos: &mut usize,
        prefix_bits: u8,
    ) -> Result<Header, H2Error> {
        let name_index = decode_int(block, pos, prefix_bits)?;
        let name = if name_index == 0 {
            decode_str(block, pos)?
        } else {
            lookup(&self.table, name_index)?.name
        };
        let value = decode_str(block, pos)?;
        Ok(Header::from_bytes(name, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(name: &str, value: &str) -> Header {
        Header::new(name, value)
    }

    #[test]
    fn indexed_static_entries() {
        // GET http request against the static table only:
        // :method GET = 2, :scheme http = 6, :path / = 4, then a literal
        // :authority with the name at index 1.
        let headers = vec![
            h(":method", "GET"),
            h(":scheme", "http"),
            h(":path", "/"),
            h(":authority", "www.example.com"),
        ];
        let mut encoder = Encoder::new();
        let block = encoder.encode(&headers);

        assert_eq!(block[0], 0x82);
        assert_eq!(block[1], 0x86);
        assert_eq!(block[2], 0x84);
        assert_eq!(block[3], 0x41);

        let mut decoder = Decoder::new();
        assert_eq!(decoder.decode(&block).unwrap(), headers);
    }

    #[test]
    fn dynamic_table_reuse_across_blocks() {
        let mut encoder = Encoder::new();
        let mut decoder = Decoder::new();

        let first = vec![
            h(":method", "GET"),
            h(":authority", "www.example.com"),
            h("cache-control", "no-cache"),
        ];
        let block1 = encoder.encode(&first);
        assert_eq!(decoder.decode(&block1).unwrap(), first);

        // The authority and cache-control entries are now in both dynamic
        // tables; the second block must index them in a few bytes.
        let second = vec![
            h(":method", "GET"),
            h(":authority", "www.example.com"),
            h("cache-control", "no-cache"),
        ];
        let block2 = encoder.encode(&second);
        assert!(block2.len() <= 3, "expected full indexing, got {block2:?}");
        assert_eq!(decoder.decode(&block2).unwrap(), second);
    }

    #[test]
    fn sensitive_headers_are_never_indexed() {
        let mut encoder = Encoder::new();
        let headers = vec![h("authorization", "Basic dG9wc2VjcmV0")];
        let block = encoder.encode(&headers);
        // 0x1f 0x07 is never-indexed with static name index 23.
        assert_eq!(block[0] & 0xf0, 0x10);

        // Encoding again produces the same bytes: nothing was added to the
        // dynamic table.
        let block2 = encoder.encode(&headers);
        assert_eq!(block, block2);

        let mut decoder = Decoder::new();
        assert_eq!(decoder.decode(&block).unwrap(), headers);
    }

    #[test]
    fn table_size_update_is_emitted_and_honored() {
        let mut encoder = Encoder::new();
        let mut decoder = Decoder::new();

        let first = vec![h("x-trace", "abc")];
        let block = encoder.encode(&first);
        assert_eq!(decoder.decode(&block).unwrap(), first);

        encoder.set_max_table_size(0);
        let second = vec![h("x-trace", "abc")];
        let block = encoder.encode(&second);
        // Starts with a table size update to zero.
        assert_eq!(block[0], 0x20);
        assert_eq!(decoder.decode(&block).unwrap(), second);
        assert_eq!(decoder.table.len(), 0);
    }

    #[test]
    fn decoder_rejects_resize_above_advertised_ceiling() {
        let mut decoder = Decoder::new();
        let mut block = BytesMut::new();
        encode_int(DEFAULT_TABLE_SIZE as usize + 1, 5, 0x20, &mut block);
        assert!(decoder.decode(&block).is_err());
    }

    #[test]
    fn eviction_keeps_size_within_bounds() {
        let mut table = DynamicTable::with_max_size(100);
        table.insert(h("aaaa", "bbbb"));
        table.insert(h("cccc", "dddd"));
        // Each entry costs 8 + 32 = 40; the third insert evicts the first.
        table.insert(h("eeee", "ffff"));
        assert_eq!(table.len(), 2);
        assert!(table.size <= 100);
        assert_eq!(table.get(0).unwrap(), &h("eeee", "ffff"));
        assert_eq!(table.get(1).unwrap(), &h("cccc", "dddd"));
    }

    #[test]
    fn oversized_entry_clears_table() {
        let mut table = DynamicTable::with_max_size(40);
        table.insert(h("ok", "val"));
        assert_eq!(table.len(), 1);
        table.insert(h("too-long-name", "with a value that cannot fit"));
        assert_eq!(table.len(), 0);
        assert_eq!(table.size, 0);
    }

    #[test]
    fn integer_boundary_values() {
        for value in [0usize, 9, 30, 31, 32, 127, 128, 1337, 1 << 20] {
            for prefix in [4u8, 5, 6, 7] {
                let mut out = BytesMut::new();
                encode_int(value, prefix, 0, &mut out);
                let mut pos = 0;
                assert_eq!(decode_int(&out, &mut pos, prefix).unwrap(), value);
                assert_eq!(pos, out.len());
            }
        }
    }

    #[test]
    fn huffman_coded_authority_matches_reference() {
        // "www.example.com" Huffman-encodes to the canonical 12 bytes.
        let mut out = BytesMut::new();
        encode_str(b"www.example.com", &mut out);
        assert_eq!(
            &out[..],
            &[0x8c, 0xf1, 0xe3, 0xc2, 0xe5, 0xf2, 0x3a, 0x6b, 0xa0, 0xab, 0x90, 0xf4, 0xff][..]
        );
    }

    #[test]
    fn symmetric_over_many_blocks() {
        let mut encoder = Encoder::new();
        let mut decoder = Decoder::new();
        for i in 0..50 {
            let headers = vec![
                h(":method", "GET"),
                h(":path", &format!("/resource/{i}")),
                h("x-request-id", &format!("{i:032x}")),
                h("accept", "*/*"),
            ];
            let block = encoder.encode(&headers);
            assert_eq!(decoder.decode(&block).unwrap(), headers, "block {i}");
        }
    }
}
