use camino::Utf8Path;
use camino::Utf8PathBuf;
use p11_token::CryptokiConfigDirect;
use p11_token::SecretString;
use serde::Deserialize;
use std::sync::Arc;

pub const DEFAULT_PRIVATE_KEY_LABEL: &str = "Device Priv TLS Key";
pub const DEFAULT_PUBLIC_KEY_LABEL: &str = "Device Pub TLS Key";
pub const DEFAULT_DEVICE_CERTIFICATE_LABEL: &str = "Device Cert";
pub const DEFAULT_JITP_CERTIFICATE_LABEL: &str = "JITP Cert";

/// Configuration of a provisioning run, read from a TOML file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProvisioningConfig {
    /// Generate the keypair on the token instead of importing one.
    #[serde(default = "default_generate_keys_on_device")]
    pub generate_keys_on_device: bool,

    /// Which half of on-device provisioning to run.
    #[serde(default)]
    pub demo_part: DemoPart,

    /// Replace credentials already on the token when importing.
    #[serde(default)]
    pub reprovision_each_time: bool,

    #[serde(default)]
    pub token: TokenConfig,

    #[serde(default)]
    pub labels: LabelConfig,

    #[serde(default)]
    pub credentials: CredentialsConfig,
}

fn default_generate_keys_on_device() -> bool {
    true
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        ProvisioningConfig {
            generate_keys_on_device: default_generate_keys_on_device(),
            demo_part: DemoPart::default(),
            reprovision_each_time: false,
            token: TokenConfig::default(),
            labels: LabelConfig::default(),
            credentials: CredentialsConfig::default(),
        }
    }
}

/// `0` generates a keypair and emits a CSR, `1` imports the certificates signed from that CSR.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "u8")]
pub enum DemoPart {
    #[default]
    GenerateCsr,
    ImportCertificates,
}

impl TryFrom<u8> for DemoPart {
    type Error = ConfigError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(DemoPart::GenerateCsr),
            1 => Ok(DemoPart::ImportCertificates),
            other => Err(ConfigError::InvalidDemoPart(other)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TokenConfig {
    pub module_path: Option<Utf8PathBuf>,
    pub pin: Option<SecretString>,
    pub token_label: Option<String>,
    pub serial: Option<String>,
}

impl TokenConfig {
    pub fn cryptoki_config(&self) -> Result<CryptokiConfigDirect, ConfigError> {
        let module_path = self
            .module_path
            .clone()
            .ok_or(ConfigError::MissingModulePath)?;
        let pin = self.pin.clone().ok_or(ConfigError::MissingPin)?;
        Ok(CryptokiConfigDirect {
            module_path,
            pin,
            token_label: self.token_label.as_deref().map(Arc::from),
            serial: self.serial.as_deref().map(Arc::from),
        })
    }
}

/// Labels of the token objects written during provisioning.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LabelConfig {
    pub private_key: String,
    pub public_key: String,
    pub device_certificate: String,
    pub jitp_certificate: String,
}

impl Default for LabelConfig {
    fn default() -> Self {
        LabelConfig {
            private_key: DEFAULT_PRIVATE_KEY_LABEL.to_string(),
            public_key: DEFAULT_PUBLIC_KEY_LABEL.to_string(),
            device_certificate: DEFAULT_DEVICE_CERTIFICATE_LABEL.to_string(),
            jitp_certificate: DEFAULT_JITP_CERTIFICATE_LABEL.to_string(),
        }
    }
}

impl LabelConfig {
    /// Every label provisioning writes, i.e. what has to go before new credentials come in.
    pub fn all(&self) -> [&str; 4] {
        [
            &self.private_key,
            &self.public_key,
            &self.device_certificate,
            &self.jitp_certificate,
        ]
    }
}

/// The credentials imported into the token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CredentialsConfig {
    /// PEM certificate stored under the device certificate label.
    pub client_certificate: Option<Utf8PathBuf>,
    /// PEM P-256 private key, SEC1 or PKCS #8, used in import mode.
    pub client_private_key: Option<Utf8PathBuf>,
    /// PEM certificate of the JITP CA. A missing or empty file is skipped.
    pub jitp_ca_certificate: Option<Utf8PathBuf>,
}

impl CredentialsConfig {
    fn resolve_relative_to(&mut self, dir: &Utf8Path) {
        for path in [
            &mut self.client_certificate,
            &mut self.client_private_key,
            &mut self.jitp_ca_certificate,
        ]
        .into_iter()
        .flatten()
        {
            if path.is_relative() {
                *path = dir.join(&*path);
            }
        }
    }
}

/// What a provisioning run does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningMode {
    /// Import a pre-minted private key and certificate.
    ImportKeyAndCertificate,
    /// Generate a keypair on the token and emit a CSR.
    GenerateCsr,
    /// Import the certificates signed from a previously emitted CSR.
    ImportCertificates,
}

impl ProvisioningConfig {
    /// Reads the configuration file. Relative credential paths are resolved from its directory.
    pub fn load(path: &Utf8Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        let mut config = Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })?;
        if let Some(dir) = path.parent() {
            config.credentials.resolve_relative_to(dir);
        }
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn mode(&self) -> ProvisioningMode {
        match (self.generate_keys_on_device, self.demo_part) {
            (false, _) => ProvisioningMode::ImportKeyAndCertificate,
            (true, DemoPart::GenerateCsr) => ProvisioningMode::GenerateCsr,
            (true, DemoPart::ImportCertificates) => ProvisioningMode::ImportCertificates,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file {path}")]
    Read {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse configuration file {path}")]
    Parse {
        path: Utf8PathBuf,
        source: toml::de::Error,
    },

    #[error("demo_part must be 0 or 1, got {0}")]
    InvalidDemoPart(u8),

    #[error("No PKCS #11 module configured, set token.module_path or pass --module-path")]
    MissingModulePath,

    #[error("No PIN configured, set token.pin or pass --pin")]
    MissingPin,
}
