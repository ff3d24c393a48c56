//! Variable attribute bits and the write-path legality rules.

use bitflags::bitflags;

bitflags! {
    /// UEFI variable attributes, a 32-bit bitfield on the wire.
    #[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
    pub struct VarAttrs: u32 {
        const NON_VOLATILE = 0x01;
        const BOOTSERVICE_ACCESS = 0x02;
        const RUNTIME_ACCESS = 0x04;
        const HARDWARE_ERROR_RECORD = 0x08;
        /// Legacy counter-based authentication. Always rejected.
        const AUTHENTICATED_WRITE_ACCESS = 0x10;
        const TIME_BASED_AUTHENTICATED_WRITE_ACCESS = 0x20;
        const APPEND_WRITE = 0x40;
    }
}

impl VarAttrs {
    /// `NV | BS | RT | TIME_BASED_AUTH`, the attributes every secure-boot
    /// policy variable carries.
    pub const POLICY: VarAttrs = VarAttrs::NON_VOLATILE
        .union(VarAttrs::BOOTSERVICE_ACCESS)
        .union(VarAttrs::RUNTIME_ACCESS)
        .union(VarAttrs::TIME_BASED_AUTHENTICATED_WRITE_ACCESS);

    pub fn time_based_auth(self) -> bool {
        self.contains(VarAttrs::TIME_BASED_AUTHENTICATED_WRITE_ACCESS)
    }

    pub fn append_write(self) -> bool {
        self.contains(VarAttrs::APPEND_WRITE)
    }

    /// The attribute bits that identify a variable, with the per-write
    /// append bit masked off.
    pub fn stored(self) -> VarAttrs {
        self.difference(VarAttrs::APPEND_WRITE)
    }

    /// Applies the SetVariable legality table.
    ///
    /// Rejected outright: unknown bits, the legacy
    /// `AUTHENTICATED_WRITE_ACCESS` path, and `RUNTIME_ACCESS` without
    /// `BOOTSERVICE_ACCESS`. Everything else (plain, boot-only, volatile,
    /// hardware-error and time-based-auth combinations, with or without
    /// `APPEND_WRITE`) is accepted.
    pub fn validate(raw: u32) -> Result<VarAttrs, InvalidAttrs> {
        let attrs = VarAttrs::from_bits(raw).ok_or(InvalidAttrs::UnknownBits)?;

        if attrs.contains(VarAttrs::AUTHENTICATED_WRITE_ACCESS) {
            return Err(InvalidAttrs::LegacyAuth);
        }

        if attrs.contains(VarAttrs::RUNTIME_ACCESS)
            && !attrs.contains(VarAttrs::BOOTSERVICE_ACCESS)
        {
            return Err(InvalidAttrs::RuntimeWithoutBoot);
        }

        Ok(attrs)
    }
}

/// Reason an attribute word was rejected.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum InvalidAttrs {
    /// Bits outside the defined attribute mask.
    UnknownBits,
    /// `AUTHENTICATED_WRITE_ACCESS` is the deprecated counter-based path.
    LegacyAuth,
    /// `RUNTIME_ACCESS` requires `BOOTSERVICE_ACCESS`.
    RuntimeWithoutBoot,
}
