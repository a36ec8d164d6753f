//! tantivy schema and document conversion

use mailidx_common::flags;
use mailidx_common::types::{MessageDocument, Property};
use mailidx_common::{Error, Result};
use tantivy::schema::{Field, Schema, TantivyDocument, Value, FAST, INDEXED, STORED, STRING, TEXT};

use crate::index::timestamp;

/// Matches every document; anchors queries made only of exclusions
pub(crate) const TAUTOLOGY: &str = "uid:[0 TO *]";

#[derive(Debug, Clone, Copy)]
pub(crate) struct Fields {
    pub uid: Field,
    pub mailbox_id: Field,
    pub size: Field,
    pub internal_date: Field,
    pub date: Field,
    pub subject: Field,
    pub from: Field,
    pub to: Field,
    pub cc: Field,
    pub bcc: Field,
    pub x_ml_name: Field,
    pub x_mail_count: Field,
    pub body: Field,
    pub flags: Field,
    pub flag_terms: Field,
    pub location: Field,
}

pub(crate) fn build_schema() -> Schema {
    let mut builder = Schema::builder();
    builder.add_u64_field("uid", INDEXED | STORED | FAST);
    builder.add_u64_field("mailbox_id", INDEXED | STORED | FAST);
    builder.add_u64_field("size", INDEXED | STORED | FAST);
    builder.add_i64_field("internal_date", INDEXED | STORED | FAST);
    builder.add_i64_field("date", INDEXED | STORED | FAST);
    builder.add_text_field("subject", TEXT | STORED);
    builder.add_text_field("from_addr", TEXT | STORED);
    builder.add_text_field("to_addr", TEXT | STORED);
    builder.add_text_field("cc_addr", TEXT | STORED);
    builder.add_text_field("bcc_addr", TEXT | STORED);
    builder.add_text_field("x_ml_name", STRING | STORED);
    builder.add_u64_field("x_mail_count", INDEXED | STORED | FAST);
    builder.add_text_field("body", TEXT | STORED);
    // Raw flag string, returned as-is by get_flags
    builder.add_text_field("flags", STORED);
    // One hex-encoded token per flag, see `flag_term`
    builder.add_text_field("flag_terms", STRING);
    builder.add_text_field("location", STORED);
    builder.build()
}

/// Field name used in query text for a property
pub(crate) fn field_name(property: Property) -> &'static str {
    match property {
        Property::Uid => "uid",
        Property::Size => "size",
        Property::InternalDate => "internal_date",
        Property::Date => "date",
        Property::Subject => "subject",
        Property::From => "from_addr",
        Property::To => "to_addr",
        Property::Cc => "cc_addr",
        Property::Bcc => "bcc_addr",
        Property::XMlName => "x_ml_name",
        Property::XMailCount => "x_mail_count",
        Property::MailboxId => "mailbox_id",
    }
}

/// Indexed token for a flag: case folded, hex encoded so `\` never reaches the query parser
pub(crate) fn flag_term(flag: &str) -> String {
    format!("f{}", hex::encode(flag.to_ascii_lowercase()))
}

impl Fields {
    pub fn from_schema(schema: &Schema) -> Result<Self> {
        let field = |name: &str| {
            schema
                .get_field(name)
                .map_err(|e| Error::IndexUnavailable(format!("schema mismatch: {}", e)))
        };

        Ok(Self {
            uid: field("uid")?,
            mailbox_id: field("mailbox_id")?,
            size: field("size")?,
            internal_date: field("internal_date")?,
            date: field("date")?,
            subject: field("subject")?,
            from: field("from_addr")?,
            to: field("to_addr")?,
            cc: field("cc_addr")?,
            bcc: field("bcc_addr")?,
            x_ml_name: field("x_ml_name")?,
            x_mail_count: field("x_mail_count")?,
            body: field("body")?,
            flags: field("flags")?,
            flag_terms: field("flag_terms")?,
            location: field("location")?,
        })
    }

    /// Stored text field behind a header substring property
    pub fn text_field(&self, property: Property) -> Option<Field> {
        match property {
            Property::Subject => Some(self.subject),
            Property::From => Some(self.from),
            Property::To => Some(self.to),
            Property::Cc => Some(self.cc),
            Property::Bcc => Some(self.bcc),
            _ => None,
        }
    }

    pub fn to_document(&self, message: &MessageDocument, location: &str) -> TantivyDocument {
        self.to_document_with_flags(message, location, Some(&message.flags))
    }

    /// Like [`Fields::to_document`], but `None` leaves the flag fields out entirely
    pub fn to_document_with_flags(
        &self,
        message: &MessageDocument,
        location: &str,
        message_flags: Option<&str>,
    ) -> TantivyDocument {
        let mut doc = TantivyDocument::default();
        doc.add_u64(self.uid, message.uid);
        doc.add_u64(self.mailbox_id, message.mailbox_id);
        doc.add_u64(self.size, message.size);
        doc.add_i64(self.internal_date, message.internal_date.timestamp());
        if let Some(date) = message.date {
            doc.add_i64(self.date, date.timestamp());
        }
        doc.add_text(self.subject, &message.subject);
        doc.add_text(self.from, &message.from);
        doc.add_text(self.to, &message.to);
        doc.add_text(self.cc, &message.cc);
        doc.add_text(self.bcc, &message.bcc);
        if let Some(ml_name) = &message.x_ml_name {
            doc.add_text(self.x_ml_name, ml_name);
        }
        if let Some(count) = message.x_mail_count {
            doc.add_u64(self.x_mail_count, count);
        }
        doc.add_text(self.body, &message.body);

        if let Some(message_flags) = message_flags {
            let message_flags = flags::normalize(message_flags);
            for flag in flags::tokens(&message_flags) {
                doc.add_text(self.flag_terms, flag_term(flag));
            }
            doc.add_text(self.flags, message_flags);
        }
        doc.add_text(self.location, location);
        doc
    }

    /// Rebuild the message and its location from a stored document
    pub fn from_document(&self, doc: &TantivyDocument) -> Result<(MessageDocument, String)> {
        let u64_of = |field: Field| doc.get_first(field).and_then(|v| v.as_u64());
        let i64_of = |field: Field| doc.get_first(field).and_then(|v| v.as_i64());
        let text_of = |field: Field| {
            doc.get_first(field)
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };

        let uid = u64_of(self.uid)
            .ok_or_else(|| Error::Storage("stored document has no uid".to_string()))?;

        let message = MessageDocument {
            uid,
            mailbox_id: u64_of(self.mailbox_id).unwrap_or_default(),
            size: u64_of(self.size).unwrap_or_default(),
            internal_date: timestamp(i64_of(self.internal_date).unwrap_or_default()),
            date: i64_of(self.date).map(timestamp),
            subject: text_of(self.subject).unwrap_or_default(),
            from: text_of(self.from).unwrap_or_default(),
            to: text_of(self.to).unwrap_or_default(),
            cc: text_of(self.cc).unwrap_or_default(),
            bcc: text_of(self.bcc).unwrap_or_default(),
            x_ml_name: text_of(self.x_ml_name),
            x_mail_count: u64_of(self.x_mail_count),
            body: text_of(self.body).unwrap_or_default(),
            flags: text_of(self.flags).unwrap_or_default(),
        };

        Ok((message, text_of(self.location).unwrap_or_default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_flag_term_is_case_insensitive() {
        assert_eq!(flag_term("\\Seen"), flag_term("\\SEEN"));
        assert_eq!(flag_term("\\Seen"), "f5c7365656e");
    }

    #[test]
    fn test_document_conversion() {
        let schema = build_schema();
        let fields = Fields::from_schema(&schema).unwrap();

        let mut message = MessageDocument::new(7, 2, Utc.timestamp_opt(1_700_000_000, 0).unwrap());
        message.subject = "Weekly report".to_string();
        message.x_ml_name = Some("ruby-list".to_string());
        message.x_mail_count = Some(42);
        message.body = "numbers are up".to_string();
        message.flags = " \\Seen  $Work ".to_string();

        let doc = fields.to_document(&message, "INBOX/7");
        let (restored, location) = fields.from_document(&doc).unwrap();

        message.flags = "\\Seen $Work".to_string();
        assert_eq!(restored, message);
        assert_eq!(location, "INBOX/7");
    }

    #[test]
    fn test_document_without_flags() {
        let fields = Fields::from_schema(&build_schema()).unwrap();
        let mut message = MessageDocument::new(3, 1, Utc.timestamp_opt(1_700_000_000, 0).unwrap());
        message.flags = "\\Seen".to_string();

        let doc = fields.to_document_with_flags(&message, "INBOX/3", None);
        assert!(doc.get_first(fields.flags).is_none());
        assert!(doc.get_first(fields.flag_terms).is_none());
        assert_eq!(fields.text_field(Property::From), Some(fields.from));
        assert_eq!(fields.text_field(Property::XMlName), None);
    }
}
