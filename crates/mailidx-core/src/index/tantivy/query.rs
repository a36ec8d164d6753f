//! Search keys to tantivy query-parser text
//!
//! Everything compiles to a single textual query. The query parser cannot run
//! a query made only of `-clause` exclusions, so each fragment remembers
//! whether it is purely exclusive; such fragments are anchored to
//! [`TAUTOLOGY`] whenever they have to stand on their own.

use super::schema::{field_name, flag_term, TAUTOLOGY};
use crate::index::key::has_terms;
use crate::index::SearchKey;
use mailidx_common::types::{
    CmpOp, Condition, MailboxQuery, PropertyValue, SequenceItem, SequenceSet, Uid,
};
use mailidx_common::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Fragment {
    pub text: String,
    /// Only `-clause` exclusions, nothing positive
    pub exclusive: bool,
}

impl Fragment {
    /// Matches everything
    pub fn empty() -> Self {
        Self::default()
    }

    fn positive(text: String) -> Self {
        Self {
            text,
            exclusive: false,
        }
    }

    fn exclusion(text: String) -> Self {
        Self {
            text,
            exclusive: true,
        }
    }

    /// Matches nothing
    fn nothing() -> Self {
        Self::exclusion(format!("-{}", TAUTOLOGY))
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }

    /// Parenthesised form that can be combined with OR or negated
    fn grouped(&self) -> String {
        if self.exclusive {
            format!("({} {})", TAUTOLOGY, self.text)
        } else {
            format!("({})", self.text)
        }
    }

    /// Final query text, anchored if it would otherwise only exclude
    pub fn into_query_text(self) -> String {
        if self.exclusive {
            format!("{} {}", TAUTOLOGY, self.text)
        } else {
            self.text
        }
    }
}

/// Conjunction of fragments; the parser's default operator is AND
pub(crate) fn and(parts: impl IntoIterator<Item = Fragment>) -> Fragment {
    let mut texts = Vec::new();
    let mut exclusive = true;
    for part in parts.into_iter().filter(|p| !p.is_empty()) {
        exclusive &= part.exclusive;
        texts.push(part.text);
    }

    if texts.is_empty() {
        Fragment::empty()
    } else {
        Fragment {
            text: texts.join(" "),
            exclusive,
        }
    }
}

/// Compile one key. `last_uid` is the value `*` stands for in UID sets.
pub(crate) fn compile(key: &SearchKey, last_uid: Uid) -> Result<Fragment> {
    match key {
        SearchKey::All => Ok(Fragment::empty()),
        SearchKey::Body(text) => {
            if text.trim().is_empty() {
                Ok(Fragment::empty())
            } else if !has_terms(text) {
                Ok(Fragment::nothing())
            } else {
                Ok(Fragment::positive(format!("body:{}", quote(text))))
            }
        }
        SearchKey::Flag(flag) | SearchKey::Keyword(flag) => Ok(Fragment::positive(format!(
            "flag_terms:{}",
            flag_term(flag)
        ))),
        SearchKey::NoFlag(flag) | SearchKey::NoKeyword(flag) => Ok(Fragment::exclusion(
            format!("-flag_terms:{}", flag_term(flag)),
        )),
        SearchKey::SequenceNumber(_) => Err(Error::NotImplemented(
            "sequence number search is not implemented".to_string(),
        )),
        SearchKey::Uid(set) => Ok(compile_uid_set(set, last_uid)),
        SearchKey::Not(inner) => {
            let inner = compile(inner, last_uid)?;
            if inner.is_empty() {
                Ok(Fragment::nothing())
            } else {
                Ok(Fragment::exclusion(format!("-{}", inner.grouped())))
            }
        }
        SearchKey::Or(a, b) => {
            let a = compile(a, last_uid)?;
            let b = compile(b, last_uid)?;
            if a.is_empty() || b.is_empty() {
                return Ok(Fragment::empty());
            }
            Ok(Fragment::positive(format!(
                "({} OR {})",
                a.grouped(),
                b.grouped()
            )))
        }
        SearchKey::Group(keys) => {
            let parts = keys
                .iter()
                .map(|k| compile(k, last_uid))
                .collect::<Result<Vec<_>>>()?;
            Ok(and(parts))
        }
        _ => match key.conditions()? {
            Some(conditions) => {
                let parts = conditions
                    .iter()
                    .map(render_condition)
                    .collect::<Result<Vec<_>>>()?;
                Ok(and(parts))
            }
            None => Ok(Fragment::empty()),
        },
    }
}

fn compile_uid_set(set: &SequenceSet, last_uid: Uid) -> Fragment {
    if set.is_empty() {
        return Fragment::empty();
    }

    let clauses: Vec<String> = set
        .items()
        .iter()
        .filter_map(|item| match *item {
            SequenceItem::Number(n) => Some(format!("uid:{}", n)),
            SequenceItem::Last => Some(format!("uid:{}", last_uid)),
            SequenceItem::Range(first, None) => Some(format!("uid:[{} TO *]", first)),
            SequenceItem::Range(first, Some(last)) if first <= last => {
                Some(format!("uid:[{} TO {}]", first, last))
            }
            SequenceItem::Range(..) => None,
        })
        .collect();

    match clauses.len() {
        0 => Fragment::nothing(),
        1 => Fragment::positive(clauses.concat()),
        _ => Fragment::positive(format!("({})", clauses.join(" OR "))),
    }
}

/// Render an attribute condition as a field clause
pub(crate) fn render_condition(condition: &Condition) -> Result<Fragment> {
    let field = field_name(condition.property);
    let value = match &condition.value {
        PropertyValue::Int(n) if condition.property.is_numeric() => n.to_string(),
        PropertyValue::Text(s) if !condition.property.is_numeric() => quote(s),
        other => {
            return Err(Error::InvalidQuery(format!(
                "value {} does not fit property {}",
                other, condition.property
            )))
        }
    };

    let text = match condition.op {
        CmpOp::Eq | CmpOp::Contains => format!("{}:{}", field, value),
        CmpOp::Lt => format!("{}:[* TO {}}}", field, value),
        CmpOp::Le => format!("{}:[* TO {}]", field, value),
        CmpOp::Gt => format!("{}:{{{} TO *]", field, value),
        CmpOp::Ge => format!("{}:[{} TO *]", field, value),
    };
    Ok(Fragment::positive(text))
}

/// Fragment for a stored mailbox query
pub(crate) fn render_query(query: &MailboxQuery) -> Result<Fragment> {
    let main = query.main.trim();
    let mut parts = Vec::with_capacity(query.sub.len() + 1);
    if !main.is_empty() {
        let exclusive = main.split_whitespace().all(|t| t.starts_with('-'));
        parts.push(Fragment {
            text: main.to_string(),
            exclusive,
        });
    }
    for condition in &query.sub {
        parts.push(render_condition(condition)?);
    }
    Ok(and(parts))
}

/// Phrase literal. Quotes and backslashes are dropped because the phrase
/// grammar has no escapes; the tokenizer discards them anyway.
pub(crate) fn quote(s: &str) -> String {
    let cleaned: String = s
        .chars()
        .map(|c| if c == '"' || c == '\\' { ' ' } else { c })
        .collect();
    format!("\"{}\"", cleaned.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use mailidx_common::types::Property;
    use pretty_assertions::assert_eq;

    fn text(key: &SearchKey) -> String {
        compile(key, 10).unwrap().into_query_text()
    }

    #[test]
    fn test_uid_sets() {
        let key = SearchKey::Uid(SequenceSet::parse("5:*").unwrap());
        assert_eq!(text(&key), "uid:[5 TO *]");

        let key = SearchKey::Uid(SequenceSet::parse("1,3:4,*").unwrap());
        assert_eq!(text(&key), "(uid:1 OR uid:[3 TO 4] OR uid:10)");

        let key = SearchKey::Uid(SequenceSet::parse("5:3").unwrap());
        assert_eq!(text(&key), "uid:[0 TO *] -uid:[0 TO *]");
    }

    #[test]
    fn test_flags() {
        let seen = flag_term("\\Seen");
        assert_eq!(
            text(&SearchKey::Flag("\\Seen".to_string())),
            format!("flag_terms:{}", seen)
        );
        assert_eq!(
            text(&SearchKey::NoFlag("\\Seen".to_string())),
            format!("uid:[0 TO *] -flag_terms:{}", seen)
        );
    }

    #[test]
    fn test_not_and_or() {
        let body = SearchKey::Body("hello".to_string());
        assert_eq!(
            text(&SearchKey::not(body.clone())),
            "uid:[0 TO *] -(body:\"hello\")"
        );
        assert_eq!(text(&SearchKey::not(SearchKey::All)), "uid:[0 TO *] -uid:[0 TO *]");

        let unseen = SearchKey::NoFlag("\\Seen".to_string());
        assert_eq!(
            text(&SearchKey::or(body.clone(), unseen)),
            format!(
                "((body:\"hello\") OR (uid:[0 TO *] -flag_terms:{}))",
                flag_term("\\Seen")
            )
        );
        assert_eq!(text(&SearchKey::or(body, SearchKey::All)), "");
    }

    #[test]
    fn test_body_without_terms_matches_nothing() {
        assert_eq!(text(&SearchKey::Body("   ".to_string())), "");
        assert_eq!(
            text(&SearchKey::Body("!!!".to_string())),
            "uid:[0 TO *] -uid:[0 TO *]"
        );
    }

    #[test]
    fn test_conditions() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
        assert_eq!(
            text(&SearchKey::Since(date)),
            "internal_date:[1710028800 TO *]"
        );
        assert_eq!(
            text(&SearchKey::SentOn(date)),
            "date:[1710028800 TO *] date:[* TO 1710115200}"
        );
        assert_eq!(text(&SearchKey::Larger(100)), "size:{100 TO *]");
        assert_eq!(
            text(&SearchKey::Header(Property::XMlName, "ruby-list".to_string())),
            "x_ml_name:\"ruby-list\""
        );
        assert_eq!(
            text(&SearchKey::Header(Property::Subject, "say \"hi\"".to_string())),
            "subject:\"say  hi\""
        );
    }

    #[test]
    fn test_sequence_numbers_rejected() {
        let key = SearchKey::Group(vec![SearchKey::SequenceNumber(
            SequenceSet::parse("1").unwrap(),
        )]);
        assert!(matches!(compile(&key, 0), Err(Error::NotImplemented(_))));
    }

    #[test]
    fn test_render_query_mixes_main_and_conditions() {
        let query = MailboxQuery::new(
            "mailbox_id:3",
            vec![Condition::int(Property::Size, CmpOp::Le, 20)],
        );
        assert_eq!(
            render_query(&query).unwrap().into_query_text(),
            "mailbox_id:3 size:[* TO 20]"
        );

        let bad = Condition::text(Property::Size, CmpOp::Eq, "big");
        assert!(matches!(render_condition(&bad), Err(Error::InvalidQuery(_))));
    }
}
