// src/kernel/image.rs
//! Executable-image collaborator contract
//!
//! The loader does not parse binaries. A platform-side reader (ELF or
//! otherwise) turns raw bytes into a header plus loadable segments, and the
//! loader consumes them through [`ExecutableImage`]. [`ParsedImage`] is the
//! owned form the syscall layer gets back from an [`ImageParser`].

use alloc::vec::Vec;

use bitflags::bitflags;

use super::mm::VirtAddr;

/// What kind of object the image claims to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    /// No type recorded.
    None,
    /// Relocatable object; not runnable.
    Relocatable,
    /// Executable; the only kind the loader accepts.
    Executable,
    /// Shared object; not runnable.
    SharedObject,
}

bitflags! {
    /// Segment permission flags as the image format records them.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SegmentFlags: u32 {
        /// Executable segment.
        const EXECUTE = 1 << 0;
        /// Writable segment.
        const WRITE = 1 << 1;
        /// Readable segment.
        const READ = 1 << 2;
    }
}

/// Image header fields the loader cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageHeader {
    /// Entry point virtual address.
    pub entry: VirtAddr,
    /// Object kind.
    pub kind: ImageKind,
}

/// A borrowed view of one loadable segment.
#[derive(Debug, Clone, Copy)]
pub struct Segment<'a> {
    /// Virtual address the segment is linked at.
    pub vaddr: VirtAddr,
    /// The file-backed bytes (`file_size` long); the rest of `memory_size`
    /// is zero fill.
    pub file_data: &'a [u8],
    /// In-memory extent of the segment in bytes.
    pub memory_size: u64,
    /// R/W/X flags from the image.
    pub flags: SegmentFlags,
}

/// Read access to a parsed executable image.
pub trait ExecutableImage {
    /// The image header.
    fn header(&self) -> ImageHeader;

    /// Number of loadable segments.
    fn segment_count(&self) -> usize;

    /// Segment `index`, or `None` past the end.
    fn segment(&self, index: usize) -> Option<Segment<'_>>;
}

/// One owned loadable segment of a [`ParsedImage`].
#[derive(Debug, Clone)]
pub struct OwnedSegment {
    /// Virtual address the segment is linked at.
    pub vaddr: VirtAddr,
    /// File-backed bytes.
    pub file_data: Vec<u8>,
    /// In-memory extent in bytes.
    pub memory_size: u64,
    /// R/W/X flags.
    pub flags: SegmentFlags,
}

/// An owned, fully parsed image.
#[derive(Debug, Clone)]
pub struct ParsedImage {
    /// Header fields.
    pub header: ImageHeader,
    /// Loadable segments in file order.
    pub segments: Vec<OwnedSegment>,
}

impl ExecutableImage for ParsedImage {
    fn header(&self) -> ImageHeader {
        self.header
    }

    fn segment_count(&self) -> usize {
        self.segments.len()
    }

    fn segment(&self, index: usize) -> Option<Segment<'_>> {
        self.segments.get(index).map(|s| Segment {
            vaddr: s.vaddr,
            file_data: &s.file_data,
            memory_size: s.memory_size,
            flags: s.flags,
        })
    }
}

/// Why raw bytes could not be understood as an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageError {
    /// Magic number or structure did not match the expected format.
    Malformed,
    /// A header field points outside the byte buffer.
    Truncated,
}

impl core::fmt::Display for ImageError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Malformed => f.write_str("malformed image"),
            Self::Truncated => f.write_str("truncated image"),
        }
    }
}

/// Platform image-format reader collaborator.
pub trait ImageParser {
    /// Parse raw bytes into a [`ParsedImage`].
    fn parse(&self, bytes: &[u8]) -> Result<ParsedImage, ImageError>;
}
