//! Search keys to SQL
//!
//! Text keys become an FTS5 `MATCH` expression, attribute keys become bound
//! `WHERE` clauses. Flag, UID and boolean keys cannot be expressed this way
//! and are applied afterwards as set filters.

use crate::index::key::has_terms;
use crate::index::SearchKey;
use mailidx_common::types::{CmpOp, Condition, MailboxQuery, Property, PropertyValue};
use mailidx_common::{Error, Result};
use sqlx::{QueryBuilder, Sqlite};

/// Joins FTS5 expressions of the `main` part
pub(crate) const MAIN_JOINER: &str = " AND ";

/// Compile a key to a query fragment, or `None` when it needs post-filtering
pub(crate) fn compile(key: &SearchKey) -> Result<Option<MailboxQuery>> {
    match key {
        SearchKey::All => Ok(Some(MailboxQuery::default())),
        SearchKey::Body(text) => {
            if text.trim().is_empty() {
                Ok(Some(MailboxQuery::default()))
            } else if !has_terms(text) {
                Ok(Some(nothing()))
            } else {
                Ok(Some(MailboxQuery::new(phrase(text), Vec::new())))
            }
        }
        SearchKey::SequenceNumber(_) => Err(Error::NotImplemented(
            "sequence number search is not implemented".to_string(),
        )),
        SearchKey::Group(keys) => {
            let mut merged = MailboxQuery::default();
            for key in keys {
                match compile(key)? {
                    Some(query) => merged.merge(&query, MAIN_JOINER),
                    None => return Ok(None),
                }
            }
            Ok(Some(merged))
        }
        SearchKey::Flag(_)
        | SearchKey::NoFlag(_)
        | SearchKey::Keyword(_)
        | SearchKey::NoKeyword(_)
        | SearchKey::Uid(_)
        | SearchKey::Not(_)
        | SearchKey::Or(..) => Ok(None),
        _ => Ok(Some(MailboxQuery::new(
            "",
            key.conditions()?.unwrap_or_default(),
        ))),
    }
}

/// A query no row satisfies; FTS5 rejects phrases without tokens
fn nothing() -> MailboxQuery {
    MailboxQuery::new("", vec![Condition::int(Property::Uid, CmpOp::Lt, 0)])
}

/// FTS5 phrase literal
pub(crate) fn phrase(text: &str) -> String {
    format!("\"{}\"", text.replace('"', "\"\""))
}

pub(crate) fn column(property: Property) -> &'static str {
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

fn operator(op: CmpOp) -> &'static str {
    match op {
        CmpOp::Eq => "=",
        CmpOp::Lt => "<",
        CmpOp::Le => "<=",
        CmpOp::Gt => ">",
        CmpOp::Ge => ">=",
        CmpOp::Contains => "LIKE",
    }
}

fn push_value(builder: &mut QueryBuilder<'static, Sqlite>, value: &PropertyValue) {
    match value {
        PropertyValue::Int(n) => {
            builder.push_bind(*n);
        }
        PropertyValue::Text(s) => {
            builder.push_bind(s.clone());
        }
    }
}

fn push_condition(builder: &mut QueryBuilder<'static, Sqlite>, condition: &Condition) -> Result<()> {
    let column = column(condition.property);
    let numeric = condition.property.is_numeric();

    match (&condition.value, condition.op) {
        (PropertyValue::Text(_), CmpOp::Contains) if !numeric => {
            builder.push(format!(" AND instr(lower(m.{}), lower(", column));
            push_value(builder, &condition.value);
            builder.push(")) > 0");
        }
        (PropertyValue::Int(_), op) if numeric && op != CmpOp::Contains => {
            builder.push(format!(" AND m.{} {} ", column, operator(op)));
            push_value(builder, &condition.value);
        }
        (PropertyValue::Text(_), op) if !numeric && op != CmpOp::Contains => {
            builder.push(format!(" AND m.{} {} ", column, operator(op)));
            push_value(builder, &condition.value);
        }
        (value, op) => {
            return Err(Error::InvalidQuery(format!(
                "cannot apply {:?} {} to {}",
                op, value, condition.property
            )))
        }
    }
    Ok(())
}

/// `SELECT uid, item_id, internal_date` for everything `query` matches, by UID
pub(crate) fn select(query: &MailboxQuery) -> Result<QueryBuilder<'static, Sqlite>> {
    let mut builder = QueryBuilder::new(
        "SELECT m.uid, m.item_id, m.internal_date FROM messages m WHERE 1 = 1",
    );

    for condition in &query.sub {
        push_condition(&mut builder, condition)?;
    }

    let main = query.main.trim();
    if !main.is_empty() {
        builder.push(" AND m.item_id IN (SELECT rowid FROM messages_fts WHERE messages_fts MATCH ");
        builder.push_bind(main.to_string());
        builder.push(")");
    }

    builder.push(" ORDER BY m.uid ASC");
    Ok(builder)
}
