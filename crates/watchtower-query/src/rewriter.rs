//! Query rewriting
//!
//! Rewrites are applied as byte-range edits on the original text, so
//! everything the author wrote outside the edited spans (case, spacing,
//! nested queries) is kept as-is.

use crate::lexer::{tokenize, Token, TokenKind};
use crate::parser::{self, ClauseKind, FromItem, FromSource, Select};
use crate::registry::{BuildContext, Registry};
use crate::vendor;
use regex::Regex;
use std::ops::Range;
use watchtower_core::result::variable_column;
use watchtower_core::{Error, Result};

fn placeholder_pattern() -> Result<Regex> {
    Regex::new(r"\$(\w+)\.(\w+)")
        .map_err(|e| Error::internal(format!("Failed to compile placeholder regex: {e}")))
}

/// A `table.column` reference taken from a fix-me link or exclude field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholder {
    pub table: String,
    pub column: String,
}

impl Placeholder {
    /// Parse a `table.column` reference
    pub fn parse(field: &str) -> Option<Self> {
        let (table, column) = field.trim().split_once('.')?;
        if table.is_empty() || column.is_empty() {
            return None;
        }
        Some(Self {
            table: table.to_string(),
            column: column.to_string(),
        })
    }

    /// Key used in `ResultData::variables`
    pub fn key(&self) -> String {
        format!("{}.{}", self.table, self.column)
    }
}

/// Placeholders of a fix-me link followed by the exclude field, deduplicated
pub fn placeholders(fix_me_link: &str, exclude_field: &str) -> Result<Vec<Placeholder>> {
    let mut found: Vec<Placeholder> = placeholder_pattern()?
        .captures_iter(fix_me_link)
        .map(|caps| Placeholder {
            table: caps[1].to_string(),
            column: caps[2].to_string(),
        })
        .collect();
    found.extend(Placeholder::parse(exclude_field));

    let mut unique: Vec<Placeholder> = Vec::with_capacity(found.len());
    for placeholder in found {
        if !unique.contains(&placeholder) {
            unique.push(placeholder);
        }
    }
    Ok(unique)
}

struct Edits<'s> {
    sql: &'s str,
    end: usize,
    edits: Vec<(Range<usize>, String)>,
}

impl<'s> Edits<'s> {
    fn new(sql: &'s str, end: usize) -> Self {
        Self {
            sql,
            end,
            edits: Vec::new(),
        }
    }

    fn replace(&mut self, range: Range<usize>, text: impl Into<String>) {
        self.edits.push((range, text.into()));
    }

    fn insert(&mut self, at: usize, text: impl Into<String>) {
        self.edits.push((at..at, text.into()));
    }

    /// Apply edits right to left on the statement text
    fn apply(mut self) -> String {
        self.edits
            .sort_by(|(a, _), (b, _)| b.start.cmp(&a.start).then(b.end.cmp(&a.end)));
        let mut out = self.sql[..self.end].to_string();
        for (range, text) in self.edits {
            out.replace_range(range, &text);
        }
        out
    }
}

fn find_item<'q>(select: &'q Select, table: &str) -> Option<&'q FromItem> {
    select.from_items().iter().find(|item| {
        item.table_name().is_some_and(|n| n.eq_ignore_ascii_case(table))
            || item
                .alias
                .as_deref()
                .is_some_and(|a| a.eq_ignore_ascii_case(table))
    })
}

/// Append `T.C AS tv_T__C` to the selection list for every placeholder whose
/// table is in the top-level FROM list.
///
/// Tables are referred to by their alias when they have one.
pub fn inject_variables(sql: &str, fix_me_link: &str, exclude_field: &str) -> Result<String> {
    let statement = parser::parse(sql)?;
    let select = &statement.select;

    let columns: Vec<String> = placeholders(fix_me_link, exclude_field)?
        .into_iter()
        .filter_map(|placeholder| {
            let item = find_item(select, &placeholder.table)?;
            let qualifier = item.reference_name()?;
            Some(format!(
                "{}.{} AS {}",
                quote_ident(qualifier),
                quote_ident(&placeholder.column),
                quote_ident(&variable_column(&placeholder.table, &placeholder.column))
            ))
        })
        .collect();

    let mut edits = Edits::new(sql, statement.range.end);
    if !columns.is_empty() {
        let projection = &select.projection;
        if projection.is_empty() {
            edits.insert(projection.end, format!(" {}", columns.join(", ")));
        } else {
            edits.insert(projection.end, format!(", {}", columns.join(", ")));
        }
    }
    Ok(edits.apply())
}

/// Replace every logical table, at any depth, with its tenant-scoped query
pub fn substitute_logical_tables(
    sql: &str,
    registry: &Registry,
    ctx: &BuildContext,
) -> Result<String> {
    let statement = parser::parse(sql)?;
    let mut edits = Edits::new(sql, statement.range.end);

    for item in statement.select.relations() {
        let FromSource::Table { name, .. } = &item.source else {
            continue;
        };
        if let Some(builder) = registry.get(name) {
            let alias = item.alias.as_deref().unwrap_or(name);
            edits.replace(
                item.span.clone(),
                format!("({}) AS {}", builder.build(ctx), quote_ident(alias)),
            );
        }
    }
    Ok(edits.apply())
}

/// Variable injection followed by logical table substitution
pub fn rewrite(
    sql: &str,
    fix_me_link: &str,
    exclude_field: &str,
    registry: &Registry,
    ctx: &BuildContext,
) -> Result<String> {
    let injected = inject_variables(sql, fix_me_link, exclude_field)?;
    substitute_logical_tables(&injected, registry, ctx)
}

/// Qualify cloud tables with the gateway schema of `profile`.
///
/// A schema already written in the query is replaced, so a run only ever
/// reads its own profile.
pub fn qualify_cloud_tables(sql: &str, profile: &str) -> Result<String> {
    let statement = parser::parse(sql)?;
    let mut edits = Edits::new(sql, statement.range.end);

    for item in statement.select.relations() {
        if let FromSource::Table { name, span, .. } = &item.source {
            if vendor::vendor_of_table(name).is_some() {
                let schema = vendor::profile_schema(name, profile);
                edits.replace(span.clone(), format!("{schema}.{}", quote_ident(name)));
            }
        }
    }
    Ok(edits.apply())
}

/// Drop the top-level WHERE and LIMIT and append `limit <limit>`
pub fn build_unfiltered(sql: &str, limit: u64) -> Result<String> {
    let statement = parser::parse(sql)?;
    let mut edits = Edits::new(sql, statement.range.end);

    for clause in &statement.select.clauses {
        if matches!(
            clause.kind,
            ClauseKind::Where | ClauseKind::Limit | ClauseKind::Fetch
        ) {
            edits.replace(clause.start..clause.end, "");
        }
    }
    let stripped = edits.apply();
    Ok(format!("{} limit {limit}", stripped.trim_end()))
}

/// Conjoin `<exclude_field> NOT IN (<values>)` to the top-level WHERE, or add
/// a WHERE before any trailing GROUP BY, HAVING, ORDER BY, LIMIT or OFFSET
pub fn add_exclusion(sql: &str, exclude_field: &str, values: &[String]) -> Result<String> {
    let statement = parser::parse(sql)?;
    let select = &statement.select;
    let mut edits = Edits::new(sql, statement.range.end);

    let Some(field) = Placeholder::parse(exclude_field) else {
        return Ok(edits.apply());
    };
    if values.is_empty() {
        return Ok(edits.apply());
    }

    let qualifier = find_item(select, &field.table)
        .and_then(FromItem::reference_name)
        .map_or_else(|| field.table.clone(), quote_ident);
    let list: Vec<String> = values.iter().map(|v| quote_literal(v)).collect();
    let predicate = format!(
        "{qualifier}.{} NOT IN ({})",
        quote_ident(&field.column),
        list.join(", ")
    );

    match select.clause(ClauseKind::Where) {
        Some(clause) => {
            let body = &sql[clause.body.clone()];
            edits.replace(clause.body.clone(), format!("({body}) AND {predicate}"));
        }
        None => match select.clauses.first() {
            Some(clause) => edits.insert(clause.start, format!("WHERE {predicate} ")),
            None => edits.insert(select.end, format!(" WHERE {predicate}")),
        },
    }
    Ok(edits.apply())
}

/// Whether two queries select the same expressions from the same FROM list,
/// ignoring column aliases, case and whitespace
pub fn compatible(a: &str, b: &str) -> bool {
    match (signature(a), signature(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[derive(Debug, PartialEq, Eq)]
struct Signature {
    selection: Vec<String>,
    from: Vec<String>,
}

fn signature(sql: &str) -> Result<Signature> {
    let statement = parser::parse(sql)?;
    let select = &statement.select;

    let selection = selection_expressions(&sql[select.projection.clone()])?;
    let from = select
        .from_items()
        .iter()
        .map(|item| match &item.source {
            FromSource::Table { name, .. } => name.to_lowercase(),
            FromSource::Function { name } => format!("{}()", name.to_lowercase()),
            FromSource::Subquery(query) => normalize(&sql[query.span.clone()]),
            FromSource::Values => "values".to_string(),
        })
        .collect();

    Ok(Signature { selection, from })
}

/// Words that end or join expressions and therefore cannot be implicit aliases
const EXPRESSION_KEYWORDS: &[&str] = &[
    "and", "or", "not", "is", "in", "like", "ilike", "similar", "between", "escape", "case",
    "when", "then", "else", "end", "null", "true", "false", "unknown", "distinct", "all", "any",
    "some", "exists", "at", "zone", "to", "isnull", "notnull", "collate", "overlaps", "as",
];

fn is_expression_keyword(token: &Token<'_>) -> bool {
    EXPRESSION_KEYWORDS.iter().any(|k| token.is_keyword(k))
}

/// Split a selection list into normalised expressions with aliases removed
fn selection_expressions(projection: &str) -> Result<Vec<String>> {
    let tokens: Vec<Token<'_>> = tokenize(projection)?
        .into_iter()
        .filter(|t| !t.is_trivia())
        .collect();

    let mut start = 0;
    if tokens.first().is_some_and(|t| t.is_keyword("distinct")) {
        start = 1;
        if tokens.get(1).is_some_and(|t| t.is_keyword("on")) {
            start = skip_group(&tokens, 2);
        }
    } else if tokens.first().is_some_and(|t| t.is_keyword("all")) {
        start = 1;
    }

    let mut expressions = Vec::new();
    let mut depth = 0i32;
    let mut current: Vec<&Token<'_>> = Vec::new();
    for token in &tokens[start.min(tokens.len())..] {
        match token.kind {
            TokenKind::LParen => depth += 1,
            TokenKind::RParen => depth -= 1,
            TokenKind::Comma if depth == 0 => {
                expressions.push(strip_alias(&current));
                current.clear();
                continue;
            }
            _ => {}
        }
        current.push(token);
    }
    if !current.is_empty() {
        expressions.push(strip_alias(&current));
    }
    Ok(expressions)
}

/// Index after a parenthesised group starting at `open`
fn skip_group(tokens: &[Token<'_>], open: usize) -> usize {
    let mut depth = 0i32;
    for (i, token) in tokens.iter().enumerate().skip(open) {
        match token.kind {
            TokenKind::LParen => depth += 1,
            TokenKind::RParen => {
                depth -= 1;
                if depth == 0 {
                    return i + 1;
                }
            }
            _ => {}
        }
    }
    tokens.len()
}

fn strip_alias(tokens: &[&Token<'_>]) -> String {
    let n = tokens.len();
    let keep = if n >= 3 && tokens[n - 2].is_keyword("as") && tokens[n - 1].is_identifier() {
        n - 2
    } else if n >= 2 && is_implicit_alias(tokens[n - 2], tokens[n - 1]) {
        n - 1
    } else {
        n
    };
    tokens[..keep]
        .iter()
        .map(|t| t.text.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_implicit_alias(previous: &Token<'_>, last: &Token<'_>) -> bool {
    let last_is_name = match last.kind {
        TokenKind::QuotedIdent => true,
        TokenKind::Word => !is_expression_keyword(last),
        _ => false,
    };
    let previous_ends_operand = match previous.kind {
        TokenKind::Word => !is_expression_keyword(previous),
        TokenKind::QuotedIdent
        | TokenKind::RParen
        | TokenKind::Number
        | TokenKind::String => true,
        _ => false,
    };
    last_is_name && previous_ends_operand
}

/// Lowercased tokens joined by single spaces
fn normalize(sql: &str) -> String {
    match tokenize(sql) {
        Ok(tokens) => tokens
            .iter()
            .filter(|t| !t.is_trivia())
            .map(|t| t.text.to_lowercase())
            .collect::<Vec<_>>()
            .join(" "),
        Err(_) => sql.to_lowercase(),
    }
}

/// Quote an identifier unless it is already a plain lowercase name
pub fn quote_ident(name: &str) -> String {
    let plain = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if plain {
        name.to_string()
    } else {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

/// Single-quoted SQL literal
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
