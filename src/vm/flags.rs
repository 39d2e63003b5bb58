use bitflags::bitflags;

bitflags! {
    /// Placement and binding requests for a pin.
    ///
    /// Bits from `OFFSET_MASK` up carry a page aligned offset for
    /// `OFFSET_BIAS` and `OFFSET_FIXED`; see [`PinFlags::with_offset`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PinFlags: u64 {
        /// Fail instead of evicting to make room.
        const NOEVICT = 1 << 0;
        const NOSEARCH = 1 << 1;
        /// Only evict idle entries.
        const NONBLOCK = 1 << 2;
        /// Place inside the CPU-visible aperture.
        const MAPPABLE = 1 << 3;
        /// Place below 4GiB.
        const ZONE_4G = 1 << 4;
        /// Search from the top of the address space.
        const HIGH = 1 << 5;
        const OFFSET_BIAS = 1 << 6;
        const OFFSET_FIXED = 1 << 7;
        /// Bind as requested but do not take a pin.
        const VALIDATE = 1 << 8;
        const GLOBAL = 1 << 10;
        const USER = 1 << 11;
    }
}

impl PinFlags {
    pub const OFFSET_MASK: u64 = !0xfff;

    #[must_use]
    pub const fn with_offset(self, offset: u64) -> Self {
        Self::from_bits_retain((self.bits() & !Self::OFFSET_MASK) | (offset & Self::OFFSET_MASK))
    }

    #[must_use]
    pub const fn offset(self) -> u64 {
        self.bits() & Self::OFFSET_MASK
    }

    /// The binding kinds requested. They share bit positions with the
    /// bound state kept in [`VmaFlags`].
    #[must_use]
    pub const fn bind_flags(self) -> BindFlags {
        BindFlags::from_bits_truncate(self.bits() as u32)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BindFlags: u32 {
        const GLOBAL = 1 << 10;
        const LOCAL = 1 << 11;
    }
}

/// Low bits of the entry flags word: the pin count.
pub const PIN_MASK: u32 = 0x3ff;

bitflags! {
    /// State bits of a mapping entry. The pin count lives in the low
    /// `PIN_MASK` bits of the same word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct VmaFlags: u32 {
        /// Pin count reached its top bit; fast pins are refused.
        const OVERFLOW = 0x200;
        const GLOBAL_BIND = 1 << 10;
        const LOCAL_BIND = 1 << 11;
        const BIND_MASK = Self::GLOBAL_BIND.bits() | Self::LOCAL_BIND.bits();
        /// A bind failed; the entry must be unbound before reuse.
        const ERROR = 1 << 12;
        const GGTT = 1 << 13;
        const CAN_FENCE = 1 << 14;
        const USERFAULT = 1 << 15;
        const GGTT_WRITE = 1 << 16;
    }
}

/// Cache attribute written into PTEs, and the colour used for placement on
/// address spaces that keep cache domains apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CacheLevel {
    #[default]
    None,
    Llc,
}

impl CacheLevel {
    #[must_use]
    pub const fn color(self) -> u64 {
        self as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_rides_in_upper_bits() {
        let flags = (PinFlags::GLOBAL | PinFlags::OFFSET_FIXED).with_offset(0x20_3000);
        assert_eq!(flags.offset(), 0x20_3000);
        assert!(flags.contains(PinFlags::OFFSET_FIXED));
        assert_eq!(flags.bind_flags(), BindFlags::GLOBAL);
    }

    #[test]
    fn bind_bits_match_entry_state() {
        assert_eq!(BindFlags::GLOBAL.bits(), VmaFlags::GLOBAL_BIND.bits());
        assert_eq!(BindFlags::LOCAL.bits(), VmaFlags::LOCAL_BIND.bits());
        assert_eq!(PinFlags::USER.bits() as u32, BindFlags::LOCAL.bits());
    }
}
