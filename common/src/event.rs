//! Raw event section writer
//!
//! A raw event is a fixed size buffer filled with sections by the probe
//! handler and its hooks, each section starting with a [`SectionHeader`].
//! Userspace walks the sections back using the header sizes.

use core::mem::size_of;

use crate::{
    constants::{RAW_EVENT_DATA_SIZE, SECTION_HEADER_SIZE},
    types::{RawEvent, SectionHeader},
};

/// Destination of event sections
///
/// Returns false when the section could not be added; callers drop the
/// section and carry on.
pub trait EventSink {
    fn append_section<T: Copy>(&mut self, owner: u8, data_type: u8, payload: &T) -> bool;
}

impl RawEvent {
    /// Empty event, for building events outside of the ring buffer
    pub const fn empty() -> Self {
        Self {
            size: 0,
            data: [0; RAW_EVENT_DATA_SIZE],
        }
    }

    /// Forget all sections. Must be called on freshly reserved events.
    #[inline(always)]
    pub fn reset(&mut self) {
        self.size = 0;
    }

    /// Bytes used by the sections written so far
    pub fn sections(&self) -> &[u8] {
        let used = (self.size as usize).min(RAW_EVENT_DATA_SIZE);
        &self.data[..used]
    }
}

impl EventSink for RawEvent {
    #[inline(always)]
    fn append_section<T: Copy>(&mut self, owner: u8, data_type: u8, payload: &T) -> bool {
        let size = size_of::<T>();
        let used = self.size as usize;

        if used > RAW_EVENT_DATA_SIZE || SECTION_HEADER_SIZE + size > RAW_EVENT_DATA_SIZE - used {
            return false;
        }

        let header = SectionHeader {
            owner,
            data_type,
            size: size as u16,
        };

        // Bounds checked above; sections are packed so writes are unaligned.
        unsafe {
            let base = self.data.as_mut_ptr().add(used);
            core::ptr::write_unaligned(base as *mut SectionHeader, header);
            core::ptr::write_unaligned(base.add(SECTION_HEADER_SIZE) as *mut T, *payload);
        }

        self.size += (SECTION_HEADER_SIZE + size) as u16;
        true
    }
}
