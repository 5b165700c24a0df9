//! What the operator sees on the console.
//!
//! The console is kept apart from the tracing log: it only carries the banner, the diagnostic
//! dump, the instructions and the final status line.

use std::io::Write;
use tracing::warn;

use crate::error::Diagnostic;
use crate::error::DiagnosticSink;

pub const CSR_FILE: &str = "tools/create_certs/device_cert.csr";
pub const SIGNING_SCRIPT_DIR: &str = "tools/create_certs";
pub const SIGNED_CERTIFICATES_FILE: &str = "tools/create_certs/deviceCertAndCACert.crt";
pub const PEM_FORMATTER: &str = "tools/certificate_configuration/PEMfileToCString.html";

pub const SUCCEEDED: &str = "Device credential provisioning succeeded.";
pub const FAILED: &str = "Device credential provisioning failed.";

pub struct Console<W> {
    out: W,
    diagnostics: Vec<Diagnostic>,
}

impl<W: Write> Console<W> {
    pub fn new(out: W) -> Self {
        Console {
            out,
            diagnostics: Vec::new(),
        }
    }

    pub fn line(&mut self, text: &str) {
        if let Err(err) = writeln!(self.out, "{text}") {
            warn!(%err, "Failed to write to the console");
        }
    }

    /// Prints the request and the three steps that take it to an installed certificate.
    pub fn csr_instructions(&mut self, csr_pem: &str) {
        let text = format!(
            "\n\n\
            1) PLEASE COPY THE FOLLOWING CERTIFICATE REQUEST INTO {CSR_FILE} :\n\n\
            {csr}\n\n\
            2) ONCE YOU'VE COPIED THE CERTIFICATE REQUEST, PLEASE RUN THE CERTIFICATE SIGNING SCRIPT\n\
            \tLOCATED IN {SIGNING_SCRIPT_DIR}\n\n\
            3) ONCE YOU HAVE COMPLETED RUNNING THE SCRIPT:\n\
            \ta) SPLIT THE TWO CERTIFICATES LOCATED IN {SIGNED_CERTIFICATES_FILE}\n\
            \t\t({PEM_FORMATTER} CAN BE USED TO FORMAT THEM)\n\
            \tb) SAVE THEM AS THE client_certificate AND jitp_ca_certificate FILES,\n\
            \t\tRESPECTIVELY, OF THE [credentials] SECTION OF THE CONFIGURATION FILE\n\
            \tc) SET demo_part = 1 AND RUN THE KEY PROVISIONING AGAIN\n",
            csr = csr_pem.trim_end(),
        );
        self.line(&text);
    }

    pub fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.diagnostics)
    }

    pub fn get_ref(&self) -> &W {
        &self.out
    }
}

impl<W: Write> DiagnosticSink for Console<W> {
    fn record(&mut self, diagnostic: Diagnostic) {
        self.line(&diagnostic.message);
        self.diagnostics.push(diagnostic);
    }
}
