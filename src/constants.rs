//! Various token signer wide constants.

//------------ Binary Names -------------------------------------------------

/// The friendly name of the `tokensignerd` binary.
pub const TOKENSIGNER_SERVER_APP: &str = "Token Signer";

pub const TOKENSIGNER_VERSION: &str = env!("CARGO_PKG_VERSION");

//------------ Config Files Paths -------------------------------------------

/// The default path to the config file.
pub const TOKENSIGNER_DEFAULT_CONFIG_FILE: &str = "/etc/tokensigner.conf";

//------------ Environment Variables ----------------------------------------

/// The environment variable with the log level.
///
/// The variable should contain the name of a [`log::LevelFilter`]. It will
/// be overwritten by the config file. The default is “info.”
pub const TOKENSIGNER_ENV_LOG_LEVEL: &str = "TOKENSIGNER_LOG_LEVEL";

/// The environment variable with the config file path.
pub const TOKENSIGNER_ENV_CONFIG: &str = "TOKENSIGNER_CONFIG";

//------------ Data Directory Layout ----------------------------------------

/// The Token Directory snapshot under the data dir.
pub const KEY_CONF_FILE: &str = "keyconf.json";

/// The software token key store directory under the data dir.
pub const SOFT_TOKEN_DIR: &str = "softtoken";

/// Lock files live here, under the data dir.
pub const LOCK_FILE_DIR: &str = ".locks";

/// Temporary files for atomic saves, under the data dir.
pub const TMP_FILE_DIR: &str = "tmp";

/// Lock file serializing structural changes to the software key stores.
pub const SOFT_TOKEN_LOCK_FILE: &str = "softtoken.lock";

//------------ Software Token -----------------------------------------------

/// The fixed id of the software token.
pub const SOFT_TOKEN_ID: &str = "0";

/// The module type reported for the software token.
pub const SOFT_TOKEN_MODULE_TYPE: &str = "softToken";

/// The key store that proves the software token PIN.
pub const PIN_KEY_STORE_NAME: &str = ".softtoken";

/// The alias of the PIN key store entry.
pub const PIN_ALIAS: &str = "pin";

/// The extension for all key store files.
pub const KEY_STORE_EXTENSION: &str = "p12";

/// The suffix of the backup directory created during PIN rotation.
pub const KEY_DIR_BACKUP_SUFFIX: &str = "bak";

/// The mechanism all keys sign with unless a module says otherwise.
pub const DEFAULT_SIGN_MECHANISM: &str = "CKM_RSA_PKCS";

/// Number of random bytes in a generated key id.
pub const KEY_ID_LENGTH: usize = 20;

//------------ Hardware Tokens ----------------------------------------------

/// The default format for hardware token ids.
pub const DEFAULT_TOKEN_ID_FORMAT: &str = "{moduleType}-{slotIndex}-{serialNumber}-{label}";
