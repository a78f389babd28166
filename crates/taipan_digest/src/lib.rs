//! Hashing helpers shared by the taipan crates.
//!
//! Conda metadata identifies artifacts by MD5 and SHA256 digests. This crate
//! wraps the [`digest`] ecosystem with the small surface the rest of the
//! workspace needs: computing digests of files and byte slices, parsing the
//! hex representations found in repodata, and (de)serializing digests as hex
//! strings with `serde_with`.

use std::{fs::File, io::Write, path::Path};

pub use digest::{self, Digest, Output};
pub use md5::Md5;
pub use sha2::Sha256;

/// A SHA256 digest as stored in repodata and `paths.json`.
pub type Sha256Hash = Output<Sha256>;

/// An MD5 digest as stored in repodata.
pub type Md5Hash = Output<Md5>;

/// Parses a hex string into the output of the digest `D`. Returns `None` if
/// the string is not valid hex or has the wrong length.
pub fn parse_digest_from_hex<D: Digest>(str: &str) -> Option<Output<D>> {
    let mut hash = Output::<D>::default();
    hex::decode_to_slice(str, &mut hash).ok().map(|()| hash)
}

/// Computes the digest of a byte slice.
pub fn compute_bytes_digest<D: Digest>(bytes: impl AsRef<[u8]>) -> Output<D> {
    let mut hasher = D::new();
    hasher.update(bytes);
    hasher.finalize()
}

/// Computes the digest of the file at the given path by streaming its
/// contents through the hasher.
pub fn compute_file_digest<D: Digest + Write>(path: &Path) -> Result<Output<D>, std::io::Error> {
    let mut file = File::open(path)?;
    let mut hasher = D::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hasher.finalize())
}

/// A writer that forwards everything to an inner writer while hashing the
/// bytes that pass through it.
pub struct HashingWriter<W, D: Digest> {
    writer: W,
    hasher: D,
}

impl<W, D: Digest> HashingWriter<W, D> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            hasher: D::new(),
        }
    }

    /// Consumes the writer, returning the inner writer and the digest of all
    /// bytes written.
    pub fn finalize(self) -> (W, Output<D>) {
        (self.writer, self.hasher.finalize())
    }
}

impl<W: Write, D: Digest> Write for HashingWriter<W, D> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let written = self.writer.write(buf)?;
        self.hasher.update(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

#[cfg(feature = "serde")]
pub mod serde {
    //! Hex (de)serialization of digests for use with `serde_as`.

    use std::marker::PhantomData;

    use digest::{Digest, Output};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use serde_with::{DeserializeAs, SerializeAs};

    /// Serializes the output of a digest as a lowercase hex string.
    pub struct SerializableHash<D: Digest>(PhantomData<D>);

    impl<D: Digest> SerializeAs<Output<D>> for SerializableHash<D> {
        fn serialize_as<S: Serializer>(source: &Output<D>, serializer: S) -> Result<S::Ok, S::Error> {
            hex::encode(source).serialize(serializer)
        }
    }

    impl<'de, D: Digest> DeserializeAs<'de, Output<D>> for SerializableHash<D> {
        fn deserialize_as<De: Deserializer<'de>>(deserializer: De) -> Result<Output<D>, De::Error> {
            let str = String::deserialize(deserializer)?;
            super::parse_digest_from_hex::<D>(&str)
                .ok_or_else(|| serde::de::Error::custom("failed to parse hex digest"))
        }
    }
}

#[cfg(test)]
mod test {
    use hex_literal::hex;

    use super::*;

    #[test]
    fn test_parse_digest_from_hex() {
        let digest = parse_digest_from_hex::<Sha256>(
            "7ed530efddd47a96c11197906b4008405b90e3bc2f4e0df722a36e0e6103fd9c",
        )
        .unwrap();
        assert_eq!(
            digest[..],
            hex!("7ed530efddd47a96c11197906b4008405b90e3bc2f4e0df722a36e0e6103fd9c")[..]
        );

        assert!(parse_digest_from_hex::<Sha256>("deadbeef").is_none());
        assert!(parse_digest_from_hex::<Md5>("not-hex").is_none());
    }

    #[test]
    fn test_hashing_writer() {
        let mut writer = HashingWriter::<_, Sha256>::new(Vec::new());
        writer.write_all(b"hello ").unwrap();
        writer.write_all(b"world").unwrap();
        let (bytes, digest) = writer.finalize();
        assert_eq!(bytes, b"hello world");
        assert_eq!(digest, compute_bytes_digest::<Sha256>(b"hello world"));
    }
}
