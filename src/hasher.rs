//! CRC32C (Castagnoli) checksums for log records, stream frames and disk blocks.
//!
//! Two interchangeable paths compute the same function: the CPU's `crc32`
//! instruction (SSE4.2 on x86_64, the CRC extension on aarch64) and a
//! table-driven fallback from the `crc` crate. The engine is picked once per
//! component with [`Crc32Engine::detect`]; without a hardware path and with the
//! `portable-crc` feature disabled, detection fails with
//! [`Error::PlatformNotSupported`].

use std::fmt;

use crate::error::Result;

#[cfg(feature = "portable-crc")]
static CASTAGNOLI: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISCSI);

/// Handle to a CRC32C implementation available on this machine.
///
/// The only way to obtain one is [`detect`](Self::detect) or
/// [`portable`](Self::portable), so a hardware engine always went through
/// CPU feature detection first.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Crc32Engine(Kind);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Hardware,
    #[cfg(feature = "portable-crc")]
    Portable,
}

impl fmt::Debug for Crc32Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Crc32Engine").field(&self.0).finish()
    }
}

impl Crc32Engine {
    /// Prefers the hardware instruction, falls back to the portable table.
    pub fn detect() -> Result<Self> {
        match Self::hardware() {
            Some(engine) => Ok(engine),
            None => Self::portable(),
        }
    }

    pub fn portable() -> Result<Self> {
        #[cfg(feature = "portable-crc")]
        {
            Ok(Crc32Engine(Kind::Portable))
        }
        #[cfg(not(feature = "portable-crc"))]
        {
            Err(crate::error::Error::PlatformNotSupported)
        }
    }

    fn hardware() -> Option<Self> {
        hw::available().then_some(Crc32Engine(Kind::Hardware))
    }

    pub fn hasher(self) -> Hasher {
        Hasher::new(self)
    }

    pub fn checksum(self, data: &[u8]) -> u32 {
        let mut hasher = self.hasher();
        hasher.write(data);
        hasher.checksum()
    }
}

#[derive(Clone)]
enum State {
    Hardware(u32),
    #[cfg(feature = "portable-crc")]
    Portable(crc::Digest<'static, u32>),
}

/// Incremental CRC32C. Feeding data in pieces yields the same value as a
/// single write of the concatenation.
#[derive(Clone)]
pub struct Hasher {
    engine: Crc32Engine,
    state: State,
}

impl fmt::Debug for Hasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hasher").field("engine", &self.engine).finish()
    }
}

impl Hasher {
    fn new(engine: Crc32Engine) -> Self {
        let state = match engine.0 {
            Kind::Hardware => State::Hardware(!0),
            #[cfg(feature = "portable-crc")]
            Kind::Portable => State::Portable(CASTAGNOLI.digest()),
        };
        Self { engine, state }
    }

    pub fn write(&mut self, data: &[u8]) {
        match &mut self.state {
            // SAFETY: a Hardware state comes from a Kind::Hardware engine,
            // which only Crc32Engine::hardware() builds after hw::available().
            State::Hardware(crc) => *crc = unsafe { hw::update(*crc, data) },
            #[cfg(feature = "portable-crc")]
            State::Portable(digest) => digest.update(data),
        }
    }

    pub fn checksum(&self) -> u32 {
        match &self.state {
            State::Hardware(crc) => !crc,
            #[cfg(feature = "portable-crc")]
            State::Portable(digest) => digest.clone().finalize(),
        }
    }
}

#[cfg(target_arch = "x86_64")]
mod hw {
    use std::arch::x86_64::{_mm_crc32_u64, _mm_crc32_u8};

    pub fn available() -> bool {
        std::arch::is_x86_feature_detected!("sse4.2")
    }

    #[target_feature(enable = "sse4.2")]
    pub unsafe fn update(crc: u32, data: &[u8]) -> u32 {
        let mut chunks = data.chunks_exact(8);
        let mut wide = crc as u64;
        for chunk in &mut chunks {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            wide = _mm_crc32_u64(wide, u64::from_le_bytes(word));
        }
        let mut crc = wide as u32;
        for &byte in chunks.remainder() {
            crc = _mm_crc32_u8(crc, byte);
        }
        crc
    }
}

#[cfg(target_arch = "aarch64")]
mod hw {
    use std::arch::aarch64::{__crc32cb, __crc32cd};

    pub fn available() -> bool {
        std::arch::is_aarch64_feature_detected!("crc")
    }

    #[target_feature(enable = "crc")]
    pub unsafe fn update(mut crc: u32, data: &[u8]) -> u32 {
        let mut chunks = data.chunks_exact(8);
        for chunk in &mut chunks {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            crc = __crc32cd(crc, u64::from_le_bytes(word));
        }
        for &byte in chunks.remainder() {
            crc = __crc32cb(crc, byte);
        }
        crc
    }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
mod hw {
    pub fn available() -> bool {
        false
    }

    pub unsafe fn update(crc: u32, _data: &[u8]) -> u32 {
        crc
    }
}
