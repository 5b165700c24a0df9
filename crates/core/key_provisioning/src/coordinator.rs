use certificate::CsrPhase;
use certificate::CsrTemplate;
use p11_token::Token;
use p11_token::TokenSession;
use std::io::Write;
use tracing::info;
use tracing::warn;

use crate::config::ProvisioningConfig;
use crate::config::ProvisioningMode;
use crate::error::Diagnostic;
use crate::error::DiagnosticSink;
use crate::error::ProvisioningError;
use crate::import::CredentialImporter;
use crate::keypair::KeypairProvisioner;
use crate::operator::Console;
use crate::operator::FAILED;
use crate::operator::SUCCEEDED;
use crate::state::ProvisioningState;

/// Outcome of a provisioning run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningReport {
    pub state: ProvisioningState,
    pub diagnostics: Vec<Diagnostic>,
    /// The request shown to the operator, in generate mode.
    pub csr_pem: Option<String>,
}

impl ProvisioningReport {
    pub fn succeeded(&self) -> bool {
        self.state.is_success()
    }
}

/// Provisions the device credentials held by a token.
///
/// Owns the provisioning state; the token session only lives for the duration of
/// [`KeyProvisioning::start_key_provisioning`] and is closed on every exit path.
pub struct KeyProvisioning<'t, W> {
    token: &'t dyn Token,
    config: ProvisioningConfig,
    csr_template: CsrTemplate,
    console: Console<W>,
    state: ProvisioningState,
}

impl<'t, W: Write> KeyProvisioning<'t, W> {
    pub fn new(token: &'t dyn Token, config: ProvisioningConfig, console: W) -> Self {
        KeyProvisioning {
            token,
            config,
            csr_template: CsrTemplate::default(),
            console: Console::new(console),
            state: ProvisioningState::default(),
        }
    }

    pub fn with_csr_template(self, csr_template: CsrTemplate) -> Self {
        KeyProvisioning {
            csr_template,
            ..self
        }
    }

    pub fn state(&self) -> ProvisioningState {
        self.state
    }

    pub fn console(&self) -> &Console<W> {
        &self.console
    }

    /// Runs the provisioning mode selected by the configuration.
    ///
    /// Everything the operator needs is written to the console, ending with a single status
    /// line. The returned report carries the same outcome for callers that want it.
    pub fn start_key_provisioning(&mut self) -> ProvisioningReport {
        self.state = ProvisioningState::Uninitialized;
        let mode = self.config.mode();
        match mode {
            ProvisioningMode::ImportKeyAndCertificate => {
                self.console.line("Keys are Being Imported")
            }
            ProvisioningMode::GenerateCsr | ProvisioningMode::ImportCertificates => {
                self.console.line("Keys Are Being Generated on Device")
            }
        }
        self.console.line("Starting Key Provisioning");
        info!(?mode, "Starting key provisioning");

        let csr_pem = match self.provision(mode) {
            Ok(csr_pem) => csr_pem,
            Err(err) => {
                self.state.advance(ProvisioningState::Failed { kind: err.kind() });
                None
            }
        };
        self.console.line("Ending Key Provisioning");

        let report = ProvisioningReport {
            state: self.state,
            diagnostics: self.console.take_diagnostics(),
            csr_pem,
        };
        if report.succeeded() {
            info!(state = %report.state, "Key provisioning succeeded");
            self.console.line(SUCCEEDED);
        } else {
            warn!(state = %report.state, "Key provisioning failed");
            self.console.line(FAILED);
        }
        report
    }

    fn provision(&mut self, mode: ProvisioningMode) -> Result<Option<String>, ProvisioningError> {
        let token = self.token;
        let session = token
            .open_session()
            .map_err(|e| self.console.fatal("Failed to open PKCS #11 session.", e.into()))?;

        let result = match mode {
            ProvisioningMode::GenerateCsr => self.generate_csr(session.as_ref()).map(Some),
            ProvisioningMode::ImportCertificates => {
                self.import_certificates(session.as_ref()).map(|_| None)
            }
            ProvisioningMode::ImportKeyAndCertificate => self
                .import_key_and_certificate(session.as_ref())
                .map(|_| None),
        };

        if let Err(err) = session.close() {
            warn!(%err, "Failed to close the PKCS #11 session");
        }
        result
    }

    fn generate_csr(&mut self, session: &dyn TokenSession) -> Result<String, ProvisioningError> {
        let provisioner = KeypairProvisioner::new(session, &self.config.labels);
        provisioner.destroy_credentials(&mut self.console)?;
        self.state.advance(ProvisioningState::NoCredentials);

        let keys = provisioner.generate(&mut self.console)?;
        self.state.advance(ProvisioningState::KeyPairGenerated);

        let csr_pem = self
            .csr_template
            .write_csr_pem(session, keys.handles.private_key, &keys.ec_point)
            .map_err(|e| self.console.fatal(csr_failure_message(e.phase), e.into()))?;
        self.state.advance(ProvisioningState::CsrEmitted);

        self.console.csr_instructions(&csr_pem);
        Ok(csr_pem)
    }

    fn import_certificates(
        &mut self,
        session: &dyn TokenSession,
    ) -> Result<(), ProvisioningError> {
        CredentialImporter::new(session, &self.config.labels, &self.config.credentials)
            .import_certificates(&mut self.console)?;
        self.state.advance(ProvisioningState::CertificateImported);
        Ok(())
    }

    fn import_key_and_certificate(
        &mut self,
        session: &dyn TokenSession,
    ) -> Result<(), ProvisioningError> {
        let labels = &self.config.labels;
        if !self.config.reprovision_each_time {
            let provisioned = session.object_exists(&labels.private_key).map_err(|e| {
                self.console
                    .fatal("Failed to look up existing credentials.", e.into())
            })?;
            if provisioned {
                info!(
                    label = %labels.private_key,
                    "Device already provisioned, set reprovision_each_time to replace its credentials"
                );
                self.console.line("Device credentials are already provisioned.");
                self.state.advance(ProvisioningState::CertificateImported);
                return Ok(());
            }
        }

        let provisioner = KeypairProvisioner::new(session, labels);
        provisioner.destroy_credentials(&mut self.console)?;
        self.state.advance(ProvisioningState::NoCredentials);

        let id = provisioner.new_key_id(&mut self.console)?;
        let importer = CredentialImporter::new(session, labels, &self.config.credentials);
        importer.import_private_key(&id, &mut self.console)?;
        importer.import_certificates(&mut self.console)?;
        self.state.advance(ProvisioningState::CertificateImported);
        Ok(())
    }
}

fn csr_failure_message(phase: CsrPhase) -> &'static str {
    match phase {
        CsrPhase::Subject => "Failed to set subject name of CSR context.",
        CsrPhase::Key => "Failed to initialize PK context with given information.",
        CsrPhase::Md => "Failed to set digest algorithm of CSR context.",
        CsrPhase::KeyUsage => "Failed to set key usage of CSR context.",
        CsrPhase::NsCertType => "Failed to set NS Cert Type of CSR context.",
        CsrPhase::Write => "Failed to write CSR.",
    }
}
