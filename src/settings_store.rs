//! Named blob persistence and the settings save/restore glue.

use core::fmt::Write;

use embedded_storage::nor_flash::{NorFlash, NorFlashError, NorFlashErrorKind};
use heapless::String;
use md5::{Digest, Md5};

use crate::app_state::{AppState, DecodeError, JsonBuf, JSON_BUF_LEN};

#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    /// No blob with this name stored
    NotFound,
    /// Blob or name does not fit into the storage slot or the buffer
    TooLarge,
    /// Stored header is inconsistent
    Corrupt,
    Flash(NorFlashErrorKind),
    Encode,
    Decode(DecodeError),
}

#[cfg(feature = "defmt")]
impl defmt::Format for StoreError {
    fn format(&self, f: defmt::Formatter) {
        match self {
            StoreError::NotFound => defmt::write!(f, "StoreError::NotFound"),
            StoreError::TooLarge => defmt::write!(f, "StoreError::TooLarge"),
            StoreError::Corrupt => defmt::write!(f, "StoreError::Corrupt"),
            StoreError::Flash(e) => defmt::write!(f, "StoreError::Flash({})", defmt::Debug2Format(e)),
            StoreError::Encode => defmt::write!(f, "StoreError::Encode"),
            StoreError::Decode(e) => {
                defmt::write!(f, "StoreError::Decode({})", defmt::Debug2Format(e))
            }
        }
    }
}

impl From<DecodeError> for StoreError {
    fn from(e: DecodeError) -> Self {
        StoreError::Decode(e)
    }
}

/// Byte blob storage addressed by name.
pub trait BlobStore {
    /// Loads the blob into `buf` and returns its length.
    fn load(&mut self, name: &str, buf: &mut [u8]) -> Result<usize, StoreError>;
    fn store(&mut self, name: &str, data: &[u8]) -> Result<(), StoreError>;
}

const MAGIC: [u8; 4] = *b"PSFB";
const NAME_LEN: usize = 32;
/// Magic, payload length, name length, name, padding
const HEADER_LEN: usize = 48;
/// Largest supported flash write granule
const MAX_WRITE_SIZE: usize = 32;

/// One blob in one erase sector of a NOR flash.
///
/// The sector starts with a fixed header holding the blob name and length,
/// followed by the payload.
pub struct FlashBlobStore<F: NorFlash> {
    flash: F,
    offset: u32,
}

impl<F: NorFlash> FlashBlobStore<F> {
    const VALID_GRANULES: () = assert!(
        F::WRITE_SIZE <= MAX_WRITE_SIZE
            && HEADER_LEN % F::WRITE_SIZE == 0
            && HEADER_LEN % F::READ_SIZE == 0
            && HEADER_LEN < F::ERASE_SIZE
    );

    /// `offset` must be aligned to an erase sector.
    pub fn new(flash: F, offset: u32) -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::VALID_GRANULES;
        Self { flash, offset }
    }

    pub fn capacity(&self) -> usize {
        F::ERASE_SIZE - HEADER_LEN
    }

    #[cfg(test)]
    pub(crate) fn flash(&self) -> &F {
        &self.flash
    }

    fn read_header(&mut self) -> Result<(usize, [u8; NAME_LEN], usize), StoreError> {
        let mut header = [0u8; HEADER_LEN];
        self.flash
            .read(self.offset, &mut header)
            .map_err(|e| StoreError::Flash(e.kind()))?;
        if header[0..4] != MAGIC {
            return Err(StoreError::NotFound);
        }
        let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
        let name_len = header[8] as usize;
        if name_len > NAME_LEN || len > self.capacity() {
            return Err(StoreError::Corrupt);
        }
        let mut name = [0u8; NAME_LEN];
        name.copy_from_slice(&header[9..9 + NAME_LEN]);
        Ok((len, name, name_len))
    }
}

fn round_up(len: usize, granule: usize) -> usize {
    len.div_ceil(granule) * granule
}

impl<F: NorFlash> BlobStore for FlashBlobStore<F> {
    fn load(&mut self, name: &str, buf: &mut [u8]) -> Result<usize, StoreError> {
        let (len, stored_name, name_len) = self.read_header()?;
        if &stored_name[..name_len] != name.as_bytes() {
            return Err(StoreError::NotFound);
        }
        let read_len = round_up(len, F::READ_SIZE);
        if read_len > buf.len() {
            return Err(StoreError::TooLarge);
        }
        self.flash
            .read(self.offset + HEADER_LEN as u32, &mut buf[..read_len])
            .map_err(|e| StoreError::Flash(e.kind()))?;
        Ok(len)
    }

    fn store(&mut self, name: &str, data: &[u8]) -> Result<(), StoreError> {
        if name.len() > NAME_LEN || data.len() > self.capacity() {
            return Err(StoreError::TooLarge);
        }
        let flash_err = |e: F::Error| StoreError::Flash(e.kind());
        self.flash
            .erase(self.offset, self.offset + F::ERASE_SIZE as u32)
            .map_err(flash_err)?;

        // Payload first, so an interrupted write leaves no valid header
        let payload_offset = self.offset + HEADER_LEN as u32;
        let aligned = data.len() / F::WRITE_SIZE * F::WRITE_SIZE;
        if aligned > 0 {
            self.flash
                .write(payload_offset, &data[..aligned])
                .map_err(flash_err)?;
        }
        let tail = &data[aligned..];
        if !tail.is_empty() {
            let mut chunk = [0xFFu8; MAX_WRITE_SIZE];
            chunk[..tail.len()].copy_from_slice(tail);
            self.flash
                .write(payload_offset + aligned as u32, &chunk[..F::WRITE_SIZE])
                .map_err(flash_err)?;
        }

        let mut header = [0xFFu8; HEADER_LEN];
        header[0..4].copy_from_slice(&MAGIC);
        header[4..8].copy_from_slice(&(data.len() as u32).to_le_bytes());
        header[8] = name.len() as u8;
        header[9..9 + name.len()].copy_from_slice(name.as_bytes());
        self.flash.write(self.offset, &header).map_err(flash_err)?;
        Ok(())
    }
}

/// Lower case hex MD5 digest of `data`.
pub fn md5_hex(data: &[u8]) -> String<32> {
    let digest = Md5::digest(data);
    let mut hex = String::new();
    for byte in digest.iter() {
        // 16 bytes always fit
        let _ = write!(hex, "{:02x}", byte);
    }
    hex
}

/// Serializes the full state and stores it as blob `name`.
pub fn save_state<S: BlobStore>(
    state: &AppState,
    store: &mut S,
    name: &str,
) -> Result<(), StoreError> {
    let mut buf = JsonBuf::new();
    let len = state.serialize(&mut buf).map_err(|_| StoreError::Encode)?;
    store.store(name, buf.as_bytes())?;
    log_info!("Settings saved, {} bytes, MD5 sum: {}", len, md5_hex(buf.as_bytes()).as_str());
    Ok(())
}

/// Loads blob `name` and restores the user settings from it.
pub fn restore_state<S: BlobStore>(
    state: &mut AppState,
    store: &mut S,
    name: &str,
) -> Result<(), StoreError> {
    let mut buf = [0u8; JSON_BUF_LEN];
    let len = match store.load(name, &mut buf) {
        Ok(len) => len,
        Err(StoreError::NotFound) => {
            log_info!("No stored settings found");
            return Err(StoreError::NotFound);
        }
        Err(e) => {
            log_error!("Error reading settings: {:?}", e);
            return Err(e);
        }
    };
    state.deserialize_settings(&buf[..len]).map_err(|e| {
        let e = StoreError::from(e);
        log_error!("Error deserialising the JSON settings: {:?}", e);
        e
    })?;
    log_info!("Settings restored, {} bytes", len);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_config::APP_CONSTANTS;
    use crate::mock::{MockFlash, MOCK_FLASH_SECTOR};

    fn store() -> FlashBlobStore<MockFlash> {
        FlashBlobStore::new(MockFlash::new(), MOCK_FLASH_SECTOR as u32)
    }

    #[test]
    fn md5_of_known_input() {
        assert_eq!(md5_hex(b"").as_str(), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(md5_hex(b"abc").as_str(), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn blob_round_trip_with_unaligned_length() {
        let mut s = store();
        s.store("settings.json", b"{\"a\":12345}").unwrap();
        let mut buf = [0u8; 64];
        let len = s.load("settings.json", &mut buf).unwrap();
        assert_eq!(&buf[..len], b"{\"a\":12345}");
        // The sector below is untouched
        assert!(s.flash().storage[..MOCK_FLASH_SECTOR].iter().all(|b| *b == 0xFF));
    }

    #[test]
    fn overwrite_erases_first() {
        let mut s = store();
        s.store("settings.json", b"first version").unwrap();
        s.store("settings.json", b"second").unwrap();
        let mut buf = [0u8; 64];
        let len = s.load("settings.json", &mut buf).unwrap();
        assert_eq!(&buf[..len], b"second");
        assert_eq!(s.flash().erase_count, 2);
    }

    #[test]
    fn missing_blob() {
        let mut s = store();
        let mut buf = [0u8; 16];
        assert_eq!(s.load("settings.json", &mut buf), Err(StoreError::NotFound));
        s.store("other", b"x").unwrap();
        assert_eq!(s.load("settings.json", &mut buf), Err(StoreError::NotFound));
    }

    #[test]
    fn size_limits() {
        let mut s = store();
        let big = vec![b'x'; s.capacity() + 1];
        assert_eq!(s.store("settings.json", &big), Err(StoreError::TooLarge));
        s.store("settings.json", &big[..40]).unwrap();
        let mut small = [0u8; 8];
        assert_eq!(
            s.load("settings.json", &mut small),
            Err(StoreError::TooLarge)
        );
    }

    #[test]
    fn state_save_and_restore() {
        let mut s = store();
        let mut state = AppState::new(&APP_CONSTANTS);
        state.settings.frequency_target = 180e3;
        state.settings.fan_override = true;
        save_state(&state, &mut s, "settings.json").unwrap();

        let mut restored = AppState::new(&APP_CONSTANTS);
        restore_state(&mut restored, &mut s, "settings.json").unwrap();
        assert!((restored.settings.frequency_target - 180e3).abs() < 0.1);
        assert!(restored.settings.fan_override);
    }

    #[test]
    fn unreadable_blob_keeps_defaults() {
        let mut s = store();
        s.store("settings.json", b"{\"duty_target\": 10,").unwrap();
        let mut state = AppState::new(&APP_CONSTANTS);
        let before = state.settings;
        assert!(matches!(
            restore_state(&mut state, &mut s, "settings.json"),
            Err(StoreError::Decode(_))
        ));
        assert_eq!(state.settings, before);
    }

    #[test]
    fn restore_without_blob_keeps_defaults() {
        let mut s = store();
        let mut state = AppState::new(&APP_CONSTANTS);
        let before = state.settings;
        assert_eq!(
            restore_state(&mut state, &mut s, "settings.json"),
            Err(StoreError::NotFound)
        );
        assert_eq!(state.settings, before);
    }
}
