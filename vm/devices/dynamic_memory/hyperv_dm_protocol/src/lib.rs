// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Wire definitions for the Hyper-V Dynamic Memory protocol.
//!
//! Every message starts with a [`MessageHeader`] followed by a type-specific
//! body. All structures are little-endian and carry no padding. Bit-packed
//! fields are modeled with `bitfield-struct` so that the in-memory layout
//! matches the wire layout exactly.

#![forbid(unsafe_code)]

use bitfield_struct::bitfield;
use core::fmt;
use core::mem::size_of;
use static_assertions::const_assert;
use static_assertions::const_assert_eq;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Unaligned;
use zerocopy::byteorder::little_endian::U16;
use zerocopy::byteorder::little_endian::U64;

/// The guest page size assumed by the protocol.
pub const PAGE_SIZE: usize = 4096;

/// The size of each of the two channel ring buffers.
pub const CHANNEL_BUFFER_SIZE: usize = 16 * 1024;

/// The largest inbound packet the guest accepts.
pub const MAX_PACKET_SIZE: usize = 2 * PAGE_SIZE;

/// How often the guest reports memory pressure to the host.
pub const STATUS_REPORT_INTERVAL_MS: u64 = 1000;

/// Pages the guest refuses to surrender regardless of host demand (512MB).
pub const RESERVED_FLOOR_PAGES: u64 = (512 * 1024 * 1024) / PAGE_SIZE as u64;

/// The largest number of pages reported in one inflation response (1MB).
pub const INFLATION_BATCH_PAGES: u32 = (1024 * 1024 / PAGE_SIZE) as u32;

/// Hot-add alignment reported in the capabilities, as a power of two in MB.
pub const HOT_ADD_ALIGNMENT: u8 = 7;

/// The largest page frame number representable in a [`PageRange`].
pub const MAX_PAGE_RANGE_PFN: u64 = (1 << 40) - 1;

/// The largest page count representable in a [`PageRange`].
pub const MAX_PAGE_RANGE_COUNT: u32 = (1 << 24) - 1;

/// The largest range count representable in a [`RangeCount`].
pub const MAX_RANGE_COUNT: u32 = (1 << 31) - 1;

/// Declares a transparent integer newtype with named values that still
/// accepts values it does not know about.
macro_rules! open_enum {
    (
        $(#[$a:meta])*
        $vis:vis enum $name:ident: $ty:ty {
            $($(#[$va:meta])* $variant:ident = $value:expr,)*
        }
    ) => {
        $(#[$a])*
        #[repr(transparent)]
        #[derive(Copy, Clone, PartialEq, Eq, Hash, IntoBytes, FromBytes, Immutable, KnownLayout)]
        $vis struct $name(pub $ty);

        impl $name {
            $($(#[$va])* pub const $variant: Self = Self($value);)*
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match *self {
                    $(Self::$variant => f.pad(stringify!($variant)),)*
                    Self(other) => write!(f, "{}({:#x})", stringify!($name), other),
                }
            }
        }

        impl From<$ty> for $name {
            fn from(value: $ty) -> Self {
                Self(value)
            }
        }

        impl From<$name> for $ty {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    };
}

open_enum! {
    /// The message type carried in the [`MessageHeader`].
    pub enum MessageType: u16 {
        ERROR = 0,
        VERSION_REQUEST = 1,
        VERSION_RESPONSE = 2,
        CAPABILITIES_REPORT = 3,
        CAPABILITIES_RESPONSE = 4,
        STATUS_REPORT = 5,
        INFLATION_REQUEST = 6,
        INFLATION_RESPONSE = 7,
        DEFLATION_REQUEST = 8,
        DEFLATION_RESPONSE = 9,
        HOT_ADD_REQUEST = 10,
        HOT_ADD_RESPONSE = 11,
        INFO_MESSAGE = 12,
    }
}

open_enum! {
    /// A protocol version: major in the high 16 bits, minor in the low 16.
    pub enum ProtocolVersion: u32 {
        /// Windows Server 2008 R2.
        VERSION_1 = 0x0001_0000,
        /// Windows 8.
        VERSION_2 = 0x0002_0000,
        /// Windows 10.
        VERSION_3 = 0x0003_0000,
    }
}

impl ProtocolVersion {
    /// Returns the major version number.
    pub const fn major(self) -> u16 {
        (self.0 >> 16) as u16
    }

    /// Returns the minor version number.
    pub const fn minor(self) -> u16 {
        self.0 as u16
    }
}

open_enum! {
    /// The outcome reported in a [`HotAddResponse`].
    pub enum HotAddResult: u32 {
        /// Transient failure; the host may retry later.
        FAILED = 0,
        /// The request was processed. With a zero page count, the host will
        /// not retry hot-add.
        PROCESSED = 1,
    }
}

/// The header preceding every message.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct MessageHeader {
    pub message_type: MessageType,
    /// Size of the header plus the body, in bytes.
    pub size: u16,
    pub transaction_id: u32,
}

pub const HEADER_SIZE: usize = size_of::<MessageHeader>();

#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq, Eq)]
pub struct VersionRequestFlags {
    /// Set on the final version the guest is willing to offer.
    pub is_last_attempt: bool,
    #[bits(31)]
    _reserved: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct VersionRequest {
    pub version: ProtocolVersion,
    pub flags: VersionRequestFlags,
}

/// Acceptance bit shared by the version and capabilities responses.
#[bitfield(u64)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq, Eq)]
pub struct AcceptedFlags {
    pub is_accepted: bool,
    #[bits(63)]
    _reserved: u64,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct VersionResponse {
    pub flags: AcceptedFlags,
}

#[bitfield(u64)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq, Eq)]
pub struct Capabilities {
    pub balloon: bool,
    pub hot_add: bool,
    /// Hot-add alignment as a power of two in MB.
    #[bits(4)]
    pub hot_add_alignment: u8,
    #[bits(58)]
    _reserved: u64,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct CapabilitiesReport {
    pub capabilities: Capabilities,
    pub minimum_page_count: u64,
    pub maximum_page_number: u64,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct CapabilitiesResponse {
    pub flags: AcceptedFlags,
}

/// Periodic memory pressure report. Sent without expecting a reply.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct StatusReport {
    pub available_pages: u64,
    pub committed_pages: u64,
    pub page_file_size_in_pages: u64,
    pub zero_and_free_pages: u64,
    pub page_file_writes_in_pages: u32,
    pub io_difference: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct InflationRequest {
    pub page_count: u32,
    pub reserved: u32,
}

#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq, Eq)]
pub struct RangeCount {
    /// More messages follow in the same logical transfer.
    pub more_pages: bool,
    #[bits(31)]
    pub range_count: u32,
}

/// Body of both the inflation response and the deflation request. Followed
/// on the wire by `range_count` [`PageRange`] entries.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct PageRanges {
    pub reserved: u32,
    pub count: RangeCount,
}

pub type InflationResponse = PageRanges;
pub type DeflationRequest = PageRanges;

#[bitfield(u64)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq, Eq)]
pub struct PageRange {
    #[bits(40)]
    pub start_page: u64,
    #[bits(24)]
    pub page_count: u32,
}

impl PageRange {
    /// Returns a range, or `None` if either value does not fit its field.
    pub fn from_parts(start_page: u64, page_count: u32) -> Option<Self> {
        if start_page > MAX_PAGE_RANGE_PFN || page_count > MAX_PAGE_RANGE_COUNT {
            return None;
        }
        Some(
            Self::new()
                .with_start_page(start_page)
                .with_page_count(page_count),
        )
    }

    /// Iterates the page frame numbers covered by the range.
    pub fn pages(&self) -> core::ops::Range<u64> {
        let start = self.start_page();
        start..start + u64::from(self.page_count())
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct HotAddRequest {
    pub range: PageRange,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct HotAddResponse {
    pub page_count: u32,
    pub result: HotAddResult,
}

/// Body of an info message. Followed by `info_size` bytes of records, each
/// starting with an [`InfoHeader`].
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct InfoMessage {
    pub reserved: u32,
    pub info_size: u32,
}

open_enum! {
    pub enum InfoType: u8 {
        MAX_PAGE_COUNT = 0,
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes, Unaligned)]
pub struct InfoHeader {
    /// An [`InfoType`] value.
    pub info_type: u8,
    pub data_size: U16,
}

/// Data of an [`InfoType::MAX_PAGE_COUNT`] record.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes, Unaligned)]
pub struct InfoMaxPageCount {
    pub max_page_count: U64,
}

const_assert_eq!(HEADER_SIZE, 8);
const_assert_eq!(size_of::<VersionRequest>(), 8);
const_assert_eq!(size_of::<VersionResponse>(), 8);
const_assert_eq!(size_of::<CapabilitiesReport>(), 24);
const_assert_eq!(size_of::<CapabilitiesResponse>(), 8);
const_assert_eq!(size_of::<StatusReport>(), 40);
const_assert_eq!(size_of::<InflationRequest>(), 8);
const_assert_eq!(size_of::<PageRanges>(), 8);
const_assert_eq!(size_of::<PageRange>(), 8);
const_assert_eq!(size_of::<HotAddRequest>(), 8);
const_assert_eq!(size_of::<HotAddResponse>(), 8);
const_assert_eq!(size_of::<InfoMessage>(), 8);
const_assert_eq!(size_of::<InfoHeader>(), 3);
const_assert!(INFLATION_BATCH_PAGES as usize <= max_ranges_per_message(MAX_PACKET_SIZE));

/// Returns how many [`PageRange`] entries fit in a range-carrying message of
/// at most `packet_size` bytes.
pub const fn max_ranges_per_message(packet_size: usize) -> usize {
    let fixed = HEADER_SIZE + size_of::<PageRanges>();
    if packet_size < fixed {
        return 0;
    }
    let ranges = (packet_size - fixed) / size_of::<PageRange>();
    // The header size field is 16 bits wide.
    let limit = (u16::MAX as usize - fixed) / size_of::<PageRange>();
    if ranges < limit { ranges } else { limit }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_range_limits() {
        let range = PageRange::from_parts(MAX_PAGE_RANGE_PFN, MAX_PAGE_RANGE_COUNT).unwrap();
        assert_eq!(range.start_page(), MAX_PAGE_RANGE_PFN);
        assert_eq!(range.page_count(), MAX_PAGE_RANGE_COUNT);
        assert_eq!(range.into_bits(), u64::MAX);

        assert!(PageRange::from_parts(MAX_PAGE_RANGE_PFN + 1, 1).is_none());
        assert!(PageRange::from_parts(0, MAX_PAGE_RANGE_COUNT + 1).is_none());
    }

    #[test]
    fn page_range_wire_layout() {
        let range = PageRange::from_parts(0x12_3456_789a, 0xbc_def0).unwrap();
        assert_eq!(
            range.as_bytes(),
            &[0x9a, 0x78, 0x56, 0x34, 0x12, 0xf0, 0xde, 0xbc]
        );
        let decoded = PageRange::read_from_bytes(range.as_bytes()).unwrap();
        assert_eq!(decoded, range);
        assert_eq!(decoded.pages(), 0x12_3456_789a..0x12_3456_789a + 0xbc_def0);
    }

    #[test]
    fn range_count_layout() {
        let count = RangeCount::new().with_more_pages(true).with_range_count(3);
        assert_eq!(count.into_bits(), 0b111);
        assert_eq!(RangeCount::from_bits(6).range_count(), 3);
        assert!(!RangeCount::from_bits(6).more_pages());
    }

    #[test]
    fn capabilities_layout() {
        let caps = Capabilities::new()
            .with_balloon(true)
            .with_hot_add(false)
            .with_hot_add_alignment(HOT_ADD_ALIGNMENT);
        assert_eq!(caps.into_bits(), 1 | (7 << 2));
    }

    #[test]
    fn version_request_layout() {
        let request = VersionRequest {
            version: ProtocolVersion::VERSION_1,
            flags: VersionRequestFlags::new().with_is_last_attempt(true),
        };
        assert_eq!(request.as_bytes(), &[0, 0, 1, 0, 1, 0, 0, 0]);
        assert_eq!(ProtocolVersion::VERSION_3.major(), 3);
        assert_eq!(ProtocolVersion::VERSION_3.minor(), 0);
    }

    #[test]
    fn open_enum_debug() {
        assert_eq!(format!("{:?}", MessageType::HOT_ADD_REQUEST), "HOT_ADD_REQUEST");
        assert_eq!(format!("{:?}", MessageType(99)), "MessageType(0x63)");
    }

    #[test]
    fn ranges_per_message() {
        assert_eq!(max_ranges_per_message(MAX_PACKET_SIZE), (8192 - 16) / 8);
        assert_eq!(max_ranges_per_message(8), 0);
        assert_eq!(max_ranges_per_message(usize::MAX), (65535 - 16) / 8);
    }
}
