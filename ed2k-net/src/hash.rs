use digest::Digest;
use ed2k_support::config::PART_SIZE;
use md4::Md4;
use std::io::{self, Read};

/// A single 16-byte MD4 digest, whether of a raw part or of the concatenated part digests.
pub type Ed2kHash = [u8; 16];

fn md4_digest(bytes: &[u8]) -> Ed2kHash {
    let mut hasher = Md4::new();
    hasher.update(bytes);
    let result = hasher.finalize();
    let mut out = [0u8; 16];
    out.copy_from_slice(&result);
    out
}

/// Computes the ed2k hash of a stream whose total length is known ahead of time.
///
/// Files under one part long hash to the single part's own MD4. Files an exact multiple of
/// `PART_SIZE` long get an extra trailing empty part -- on purpose, this reproduces a
/// long-standing quirk of the reference network rather than "fixing" it away.
pub fn hash_reader<R: Read>(mut reader: R, file_size: u64) -> io::Result<Ed2kHash> {
    let part_count = (file_size / PART_SIZE) + 1;
    let mut part_digests = Vec::with_capacity(part_count as usize * 16);
    let mut read_buf = vec![0u8; 64 * 1024];

    for _ in 0..part_count {
        let mut hasher = Md4::new();
        let mut remaining = PART_SIZE;

        while remaining > 0 {
            let want = std::cmp::min(remaining, read_buf.len() as u64) as usize;
            let read = reader.read(&mut read_buf[..want])?;
            if read == 0 {
                break;
            }
            hasher.update(&read_buf[..read]);
            remaining -= read as u64;
        }

        let digest = hasher.finalize();
        part_digests.extend_from_slice(&digest);
    }

    if part_count == 1 {
        let mut out = [0u8; 16];
        out.copy_from_slice(&part_digests);
        Ok(out)
    } else {
        Ok(md4_digest(&part_digests))
    }
}

/// Streaming counterpart of `hash_reader` for callers that receive a file incrementally (e.g.
/// while downloading) and don't want to buffer the whole thing to hash it once at the end.
pub struct Ed2kHasher {
    part_digests: Vec<u8>,
    current: Md4,
    current_len: u64,
    total_len: u64,
}

impl Ed2kHasher {
    pub fn new() -> Ed2kHasher {
        Ed2kHasher {
            part_digests: Vec::new(),
            current: Md4::new(),
            current_len: 0,
            total_len: 0,
        }
    }

    pub fn update(&mut self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            let room = (PART_SIZE - self.current_len) as usize;
            let take = std::cmp::min(room, bytes.len());

            self.current.update(&bytes[..take]);
            self.current_len += take as u64;
            self.total_len += take as u64;
            bytes = &bytes[take..];

            if self.current_len == PART_SIZE {
                self.flush_part();
            }
        }
    }

    fn flush_part(&mut self) {
        let finished = std::mem::replace(&mut self.current, Md4::new());
        let digest = finished.finalize();
        self.part_digests.extend_from_slice(&digest);
        self.current_len = 0;
    }

    /// Finalizes the hash. If the total byte count consumed is an exact multiple of
    /// `PART_SIZE` (including zero), this deliberately emits the trailing empty part's digest
    /// too, matching `hash_reader`'s behavior on an exact-multiple-length file.
    pub fn finish(mut self) -> Ed2kHash {
        self.flush_part();

        if self.part_digests.len() == 16 {
            let mut out = [0u8; 16];
            out.copy_from_slice(&self.part_digests);
            out
        } else {
            md4_digest(&self.part_digests)
        }
    }
}

impl Default for Ed2kHasher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }

    #[test]
    fn single_part_file_hashes_to_its_own_md4() {
        let data = vec![0u8; 100];
        let hash = hash_reader(&data[..], data.len() as u64).unwrap();
        assert_eq!(hex(&hash), "6f60e71c00d4f907e38825b752763a20");
    }

    #[test]
    fn exact_multiple_length_produces_a_trailing_empty_part() {
        let data = vec![0u8; PART_SIZE as usize];
        let hash = hash_reader(&data[..], data.len() as u64).unwrap();

        let full_part_digest = md4_digest(&data);
        let empty_part_digest = md4_digest(&[]);
        let mut concatenated = Vec::new();
        concatenated.extend_from_slice(&full_part_digest);
        concatenated.extend_from_slice(&empty_part_digest);
        let expected = md4_digest(&concatenated);

        assert_eq!(hash, expected);
    }

    #[test]
    fn streaming_hasher_matches_one_shot_reader_for_single_part() {
        let data: Vec<u8> = (0..5000u32).map(|b| b as u8).collect();

        let one_shot = hash_reader(&data[..], data.len() as u64).unwrap();

        let mut streaming = Ed2kHasher::new();
        for chunk in data.chunks(777) {
            streaming.update(chunk);
        }
        let incremental = streaming.finish();

        assert_eq!(one_shot, incremental);
    }

    #[test]
    fn streaming_hasher_matches_one_shot_reader_for_multi_part() {
        let data = vec![0x42u8; PART_SIZE as usize + 123];

        let one_shot = hash_reader(&data[..], data.len() as u64).unwrap();

        let mut streaming = Ed2kHasher::new();
        for chunk in data.chunks(CHUNK_TEST_SIZE) {
            streaming.update(chunk);
        }
        let incremental = streaming.finish();

        assert_eq!(one_shot, incremental);
    }

    const CHUNK_TEST_SIZE: usize = 65536;
}
