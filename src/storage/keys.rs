// Composite key encoding
// Lexicographic tuple keys for the ordered store

/// Builder for byte-encoded composite keys.
///
/// Keys are tuples of `(kind, part, part, ...)`. Each string part is
/// escaped (`0x00` becomes `0x00 0xFF`) and terminated with a single
/// `0x00`, and integer parts are written big-endian, so the byte order of
/// two encoded keys equals the lexicographic order of their tuples.
#[derive(Debug, Clone, Default)]
pub struct Key {
    buf: Vec<u8>,
}

/// Separator written after every string part. Sorts below the `0x00 0xFF`
/// escape, which keeps prefixes ordered before their extensions.
const TERM: u8 = 0x00;
const ESCAPE: [u8; 2] = [0x00, 0xFF];

impl Key {
    /// Start a key for the given record kind, e.g. `"gerrit.Change"`.
    pub fn kind(kind: &str) -> Self {
        let mut k = Key { buf: Vec::new() };
        k.push_str(kind);
        k
    }

    /// Append a string part.
    pub fn push_str(&mut self, part: &str) -> &mut Self {
        for &b in part.as_bytes() {
            if b == 0x00 {
                self.buf.extend_from_slice(&ESCAPE);
            } else {
                self.buf.push(b);
            }
        }
        self.buf.push(TERM);
        self
    }

    /// Append an unsigned integer part (big-endian, fixed width).
    pub fn push_u64(&mut self, part: u64) -> &mut Self {
        self.buf.extend_from_slice(&part.to_be_bytes());
        self
    }

    /// Append a signed, non-negative integer part.
    ///
    /// Change and issue numbers are non-negative by construction; encoding
    /// them as u64 keeps the byte order numeric.
    pub fn push_i64(&mut self, part: i64) -> &mut Self {
        debug_assert!(part >= 0, "key integer parts must be non-negative");
        self.push_u64(part as u64)
    }

    /// The encoded key bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Consume the builder, returning the encoded key.
    pub fn build(self) -> Vec<u8> {
        self.buf
    }

    /// The half-open range `[self, successor)` covering every key that
    /// extends this one.
    pub fn prefix_range(&self) -> (Vec<u8>, Vec<u8>) {
        (self.buf.clone(), successor(&self.buf))
    }
}

/// Smallest byte string strictly greater than every string with the given
/// prefix.
pub fn successor(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.last_mut() {
        if *last < 0xFF {
            *last += 1;
            return end;
        }
        end.pop();
    }
    // All bytes were 0xFF; the open end of the keyspace.
    vec![0xFF; prefix.len() + 1]
}

/// Cursor for decoding the parts of an encoded key.
#[derive(Debug)]
pub struct KeyReader<'a> {
    rest: &'a [u8],
}

impl<'a> KeyReader<'a> {
    pub fn new(key: &'a [u8]) -> Self {
        KeyReader { rest: key }
    }

    /// Decode the next string part.
    pub fn read_str(&mut self) -> Option<String> {
        let mut out = Vec::new();
        let mut i = 0;
        while i < self.rest.len() {
            let b = self.rest[i];
            if b == 0x00 {
                if self.rest.get(i + 1) == Some(&0xFF) {
                    out.push(0x00);
                    i += 2;
                    continue;
                }
                self.rest = &self.rest[i + 1..];
                return String::from_utf8(out).ok();
            }
            out.push(b);
            i += 1;
        }
        None
    }

    /// Decode the next fixed-width integer part.
    pub fn read_u64(&mut self) -> Option<u64> {
        if self.rest.len() < 8 {
            return None;
        }
        let (head, tail) = self.rest.split_at(8);
        self.rest = tail;
        Some(u64::from_be_bytes(head.try_into().ok()?))
    }

    pub fn read_i64(&mut self) -> Option<i64> {
        self.read_u64().map(|v| v as i64)
    }

    /// Remaining undecoded bytes.
    pub fn remainder(&self) -> &'a [u8] {
        self.rest
    }

    /// True when the whole key has been consumed.
    pub fn done(&self) -> bool {
        self.rest.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_parts() {
        let mut k = Key::kind("gerrit.Change");
        k.push_str("go-review.googlesource.com").push_str("go").push_i64(123456);
        let enc = k.build();

        let mut r = KeyReader::new(&enc);
        assert_eq!(r.read_str().as_deref(), Some("gerrit.Change"));
        assert_eq!(r.read_str().as_deref(), Some("go-review.googlesource.com"));
        assert_eq!(r.read_str().as_deref(), Some("go"));
        assert_eq!(r.read_i64(), Some(123456));
        assert!(r.done());
    }

    #[test]
    fn string_order_matches_tuple_order() {
        let enc = |a: &str, b: &str| {
            let mut k = Key::kind("k");
            k.push_str(a).push_str(b);
            k.build()
        };
        // "ab"/"c" must sort before "abc"/"" even though the concatenated
        // text would compare the other way.
        assert!(enc("ab", "c") < enc("abc", ""));
        assert!(enc("a", "z") < enc("aa", "a"));
    }

    #[test]
    fn integer_order_is_numeric() {
        let enc = |n: i64| {
            let mut k = Key::kind("k");
            k.push_i64(n);
            k.build()
        };
        assert!(enc(2) < enc(10));
        assert!(enc(0) < enc(1));
    }

    #[test]
    fn embedded_nul_is_escaped() {
        let mut k = Key::kind("k");
        k.push_str("a\0b").push_str("c");
        let enc = k.build();
        let mut r = KeyReader::new(&enc);
        assert_eq!(r.read_str().as_deref(), Some("k"));
        assert_eq!(r.read_str().as_deref(), Some("a\0b"));
        assert_eq!(r.read_str().as_deref(), Some("c"));
    }

    #[test]
    fn prefix_range_covers_extensions() {
        let mut k = Key::kind("gerrit.Change");
        k.push_str("inst");
        let (start, end) = k.prefix_range();

        let mut inside = Key::kind("gerrit.Change");
        inside.push_str("inst").push_str("proj").push_i64(7);
        let inside = inside.build();

        assert!(start.as_slice() <= inside.as_slice());
        assert!(inside.as_slice() < end.as_slice());
    }

    #[test]
    fn successor_of_all_ff() {
        let s = successor(&[0xFF, 0xFF]);
        assert!(s.as_slice() > [0xFF, 0xFF].as_slice());
    }
}
