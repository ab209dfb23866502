//! Compression format detection from the first bytes of a tarball.

/// Compression applied to an incoming environment tarball.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    Bzip2,
    Xz,
    Zstd,
    /// Plain tar.
    None,
}

/// Leading byte pairs and the format they announce.
const MAGIC: [([u8; 2], Compression); 4] = [
    ([0x1f, 0x8b], Compression::Gzip),
    ([b'B', b'Z'], Compression::Bzip2),
    ([0xfd, 0x37], Compression::Xz),
    ([0x28, 0xb5], Compression::Zstd),
];

impl Compression {
    /// Identify the format from the first two bytes of `chunk`. Unknown or
    /// too short input is treated as plain tar.
    pub fn sniff(chunk: &[u8]) -> Self {
        let Some(head) = chunk.get(..2) else {
            return Self::None;
        };
        MAGIC
            .iter()
            .find(|(magic, _)| magic[..] == *head)
            .map_or(Self::None, |(_, format)| *format)
    }

    /// The tar option selecting this decompressor, if any.
    pub fn tar_flag(self) -> Option<&'static str> {
        match self {
            Self::Gzip => Some("-z"),
            Self::Bzip2 => Some("-j"),
            Self::Xz => Some("-J"),
            Self::Zstd => Some("-Iunzstd"),
            Self::None => None,
        }
    }
}
