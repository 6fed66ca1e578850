//! Translator facade over the format parsers and the serializer

use crate::config::TranslatorConfig;
use crate::enhance::enhance;
use crate::fhir::FhirParser;
use crate::hl7::Hl7Parser;
use crate::serializer::Hl7Serializer;
use crate::{Error, Result};
use relay_document::Document;
use tracing::debug;

/// Source format detected by sniffing a raw submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Hl7,
    FhirJson,
}

/// One translator per pipeline, built from explicit configuration.
pub struct Translator {
    hl7: Hl7Parser,
    fhir: FhirParser,
    serializer: Hl7Serializer,
}

impl Translator {
    /// Create a translator from a configuration
    pub fn new(config: TranslatorConfig) -> Self {
        Self {
            hl7: Hl7Parser::new(),
            fhir: FhirParser::new(),
            serializer: Hl7Serializer::new(config),
        }
    }

    /// Detect the format of a raw submission.
    ///
    /// # Errors
    ///
    /// Fails when the payload is neither HL7v2 nor JSON.
    pub fn sniff(raw: &str) -> Result<SourceFormat> {
        let head = raw.trim_start();
        if head.starts_with("MSH") {
            Ok(SourceFormat::Hl7)
        } else if head.starts_with('{') {
            Ok(SourceFormat::FhirJson)
        } else {
            Err(Error::UnrecognizedFormat {
                details: format!(
                    "payload starts with '{}'",
                    head.chars().take(8).collect::<String>()
                ),
            })
        }
    }

    /// Parse and enhance a raw submission into a document.
    pub fn parse(&self, raw: &str) -> Result<Document> {
        let format = Self::sniff(raw)?;
        debug!(?format, bytes = raw.len(), "parsing submission");
        let parsed = match format {
            SourceFormat::Hl7 => self.hl7.parse(raw)?,
            SourceFormat::FhirJson => self.fhir.parse(raw)?,
        };
        Ok(enhance(&parsed))
    }

    /// Serialize a document into HL7v2 for the given type and version.
    pub fn serialize_hl7(
        &self,
        document: &Document,
        message_type: &str,
        version: &str,
    ) -> Result<String> {
        self.serializer.serialize(document, message_type, version)
    }

    /// Serialize a document into HL7v2 through a named template schema.
    pub fn serialize_hl7_with_schema(
        &self,
        document: &Document,
        schema_name: &str,
    ) -> Result<String> {
        self.serializer.serialize_with_schema(document, schema_name)
    }
}
