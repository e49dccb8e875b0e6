use std::fmt::Display;
use std::fs::{File, create_dir_all, read, read_to_string, write};
use std::io;
use std::io::ErrorKind::NotFound;
use std::io::Write;
use std::path::{Path, PathBuf};

use aes::Aes128;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use cbc::{Decryptor, Encryptor};
use cipher::block_padding::Pkcs7;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use log::warn;
use serde::{Deserialize, Serialize};

type Result<T> = std::result::Result<T, Error>;

const KEY_FILE: &str = "key.key";
const STORE_FILE: &str = "credentials.enc";

const KEY_LEN: usize = 16;
const IV_LEN: usize = 16;

#[derive(Debug)]
pub(crate) enum Error {
    Io(io::Error),
    Json(serde_json::Error),
    /// the store file exists but cannot be decrypted with the current key
    CorruptStore,
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Self::Io(error)
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Self::Json(error)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self {
            Self::Io(error) => write!(f, "IO error: {}", error),
            Self::Json(error) => write!(f, "JSON error: {}", error),
            Self::CorruptStore => write!(
                f,
                "stored credentials could not be decrypted, please re-enter them"
            ),
        }
    }
}

impl std::error::Error for Error {}

/// connection credentials entered by the user and persisted encrypted
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Credentials {
    pub(crate) api_id: i32,
    pub(crate) api_hash: String,
    pub(crate) phone: String,
}

impl Credentials {
    pub(crate) fn is_complete(&self) -> bool {
        self.api_id != 0 && !self.api_hash.is_empty() && !self.phone.is_empty()
    }
}

/// encrypted at rest credential storage
///
/// the AES key lives in its own file next to the store; if that file is
/// missing or fails validation a fresh key is generated, which permanently
/// invalidates any previously written store
pub(crate) struct CredentialStore {
    key: [u8; KEY_LEN],
    dir: PathBuf,
}

impl CredentialStore {
    pub(crate) fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        create_dir_all(&dir)?;
        let key = load_or_create_key(&dir.join(KEY_FILE))?;
        Ok(Self { key, dir })
    }

    /// encrypt and persist, overwriting any previous store
    pub(crate) fn save(&self, credentials: &Credentials) -> Result<()> {
        let payload = serde_json::to_vec(credentials)?;

        let mut iv = [0u8; IV_LEN];
        fastrand::fill(&mut iv);

        let ciphertext = Encryptor::<Aes128>::new(&self.key.into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(&payload);

        let mut file = File::create(self.store_path())?;
        file.write_all(&iv)?;
        file.write_all(&ciphertext)?;
        Ok(())
    }

    /// load the stored credentials, or defaults if nothing was ever saved
    pub(crate) fn load(&self) -> Result<Credentials> {
        let blob = match read(self.store_path()) {
            Ok(blob) => blob,
            Err(error) if error.kind() == NotFound => return Ok(Credentials::default()),
            Err(error) => return Err(error.into()),
        };

        if blob.len() < IV_LEN {
            return Err(Error::CorruptStore);
        }

        let (iv, ciphertext) = blob.split_at(IV_LEN);
        let plaintext = Decryptor::<Aes128>::new_from_slices(&self.key, iv)
            .map_err(|_| Error::CorruptStore)?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| Error::CorruptStore)?;

        serde_json::from_slice(&plaintext).map_err(|_| Error::CorruptStore)
    }

    fn store_path(&self) -> PathBuf {
        self.dir.join(STORE_FILE)
    }
}

/// read and validate the key file, generating a new key if it is unusable
fn load_or_create_key(path: &Path) -> Result<[u8; KEY_LEN]> {
    if let Ok(text) = read_to_string(path) {
        if let Ok(bytes) = URL_SAFE_NO_PAD.decode(text.trim()) {
            if let Ok(key) = <[u8; KEY_LEN]>::try_from(bytes) {
                return Ok(key);
            }
        }

        warn!("key file failed validation, generating a new key");
    }

    let mut key = [0u8; KEY_LEN];
    fastrand::fill(&mut key);
    write(path, URL_SAFE_NO_PAD.encode(key))?;
    Ok(key)
}
