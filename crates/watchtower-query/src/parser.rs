//! Structural SELECT parser
//!
//! Recognises just enough of PostgreSQL's SELECT grammar to locate the
//! selection list, FROM-list entries, clause boundaries and nested queries.
//! Expressions are never interpreted; every node records byte spans into
//! the original text so rewrites can be spliced in place.

use crate::lexer::{tokenize, Token, TokenKind};
use std::ops::Range;
use watchtower_core::{Error, Result};

/// A parsed single-statement query
#[derive(Debug, Clone)]
pub struct Statement {
    pub select: Select,
    /// Byte range of the statement without trailing semicolons
    pub range: Range<usize>,
}

/// Clauses following the FROM list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClauseKind {
    Where,
    GroupBy,
    Having,
    Window,
    OrderBy,
    Limit,
    Offset,
    Fetch,
    For,
}

#[derive(Debug, Clone)]
pub struct Clause {
    pub kind: ClauseKind,
    /// Byte offset of the clause keyword
    pub start: usize,
    /// Bytes of the clause body, keyword excluded
    pub body: Range<usize>,
    /// Byte offset where the next clause starts, or end of the select
    pub end: usize,
}

#[derive(Debug, Clone)]
pub struct Cte {
    pub name: String,
    pub query: Select,
}

#[derive(Debug, Clone)]
pub enum FromSource {
    Table {
        name: String,
        schema: Option<String>,
        /// Bytes of the (possibly qualified) table name
        span: Range<usize>,
    },
    Function {
        name: String,
    },
    Subquery(Box<Select>),
    Values,
}

/// One entry of a FROM list
#[derive(Debug, Clone)]
pub struct FromItem {
    /// Bytes from the source through its alias
    pub span: Range<usize>,
    pub source: FromSource,
    pub alias: Option<String>,
}

impl FromItem {
    pub fn table_name(&self) -> Option<&str> {
        match &self.source {
            FromSource::Table { name, .. } => Some(name),
            _ => None,
        }
    }

    /// The name this entry is referred to by in the rest of the query
    pub fn reference_name(&self) -> Option<&str> {
        self.alias.as_deref().or_else(|| match &self.source {
            FromSource::Table { name, .. } | FromSource::Function { name } => Some(name),
            _ => None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct FromClause {
    pub start: usize,
    pub items: Vec<FromItem>,
}

#[derive(Debug, Clone)]
pub struct SetOperation {
    /// Byte offset of UNION / INTERSECT / EXCEPT
    pub start: usize,
    pub operand: Box<Select>,
}

/// One SELECT, with everything nested below it
#[derive(Debug, Clone)]
pub struct Select {
    pub span: Range<usize>,
    /// End of this select's own clauses, before any set operation
    pub end: usize,
    pub projection: Range<usize>,
    pub from: Option<FromClause>,
    pub clauses: Vec<Clause>,
    pub limit: Option<u64>,
    pub ctes: Vec<Cte>,
    /// Queries nested in expressions (selection list, WHERE, join conditions, ...)
    pub subqueries: Vec<Select>,
    pub set_operation: Option<SetOperation>,
}

impl Select {
    pub fn from_items(&self) -> &[FromItem] {
        self.from.as_ref().map_or(&[], |from| &from.items)
    }

    pub fn clause(&self, kind: ClauseKind) -> Option<&Clause> {
        self.clauses.iter().find(|c| c.kind == kind)
    }

    /// Direct children: CTE bodies, FROM subqueries, expression subqueries
    /// and the right operand of a set operation
    pub fn children(&self) -> Vec<&Select> {
        let mut children: Vec<&Select> = self.ctes.iter().map(|c| &c.query).collect();
        for item in self.from_items() {
            if let FromSource::Subquery(query) = &item.source {
                children.push(query);
            }
        }
        children.extend(self.subqueries.iter());
        if let Some(op) = &self.set_operation {
            children.push(&op.operand);
        }
        children
    }

    /// FROM entries naming tables or functions anywhere in the tree, skipping
    /// references to common table expressions in scope
    pub fn relations(&self) -> Vec<&FromItem> {
        let mut out = Vec::new();
        let mut scope = Vec::new();
        collect_relations(self, &mut scope, &mut out);
        out
    }

    /// Table named by the leading FROM entry, looking through subqueries and CTEs
    pub fn first_table(&self) -> Option<&str> {
        let item = self.from_items().first()?;
        match &item.source {
            FromSource::Table {
                name, schema: None, ..
            } => match self.ctes.iter().find(|c| &c.name == name) {
                Some(cte) => cte.query.first_table(),
                None => Some(name),
            },
            FromSource::Table { name, .. } => Some(name),
            FromSource::Subquery(query) => query.first_table(),
            _ => None,
        }
    }
}

fn collect_relations<'s>(select: &'s Select, scope: &mut Vec<&'s str>, out: &mut Vec<&'s FromItem>) {
    let pushed = select.ctes.len();
    scope.extend(select.ctes.iter().map(|c| c.name.as_str()));

    for cte in &select.ctes {
        collect_relations(&cte.query, scope, out);
    }
    for item in select.from_items() {
        match &item.source {
            FromSource::Table {
                name, schema: None, ..
            } if scope.contains(&name.as_str()) => {}
            FromSource::Table { .. } | FromSource::Function { .. } => out.push(item),
            FromSource::Subquery(query) => collect_relations(query, scope, out),
            FromSource::Values => {}
        }
    }
    for query in &select.subqueries {
        collect_relations(query, scope, out);
    }
    if let Some(op) = &select.set_operation {
        collect_relations(&op.operand, scope, out);
    }

    scope.truncate(scope.len() - pushed);
}

/// Parse `sql` as exactly one read-only statement
pub fn parse(sql: &str) -> Result<Statement> {
    let tokens: Vec<Token<'_>> = tokenize(sql)?
        .into_iter()
        .filter(|t| !t.is_trivia())
        .collect();

    let mut statements = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, token) in tokens.iter().enumerate() {
        match token.kind {
            TokenKind::LParen => depth += 1,
            TokenKind::RParen => depth -= 1,
            TokenKind::Semicolon if depth <= 0 => {
                if i > start {
                    statements.push(start..i);
                }
                start = i + 1;
            }
            _ => {}
        }
    }
    if start < tokens.len() {
        statements.push(start..tokens.len());
    }

    let range = match statements.as_slice() {
        [] => return Err(Error::parse("Query is empty.")),
        [single] => single.clone(),
        _ => return Err(Error::parse("2 or more queries are not allowed.")),
    };

    let statement_tokens = &tokens[range];
    let parser = Parser::new(statement_tokens)?;

    let verb = parser.verb()?;
    if verb != "SELECT" {
        return Err(not_allowed(&verb));
    }

    let select = parser.parse_query(0, statement_tokens.len())?;
    let byte_range = statement_tokens[0].start..statement_tokens[statement_tokens.len() - 1].end;

    Ok(Statement {
        select,
        range: byte_range,
    })
}

fn not_allowed(verb: &str) -> Error {
    Error::parse(format!(
        "{verb} is not allowed. Monitors support read-only operations."
    ))
}

const JOIN_KEYWORDS: &[&str] = &["join", "inner", "left", "right", "full", "cross", "natural"];

const RESERVED: &[&str] = &[
    "on", "using", "where", "group", "having", "window", "order", "limit", "offset", "fetch",
    "for", "union", "intersect", "except", "outer", "lateral", "join", "inner", "left", "right",
    "full", "cross", "natural", "as", "select", "from", "with",
];

fn is_join_start(token: &Token<'_>) -> bool {
    JOIN_KEYWORDS.iter().any(|k| token.is_keyword(k))
}

fn is_reserved(token: &Token<'_>) -> bool {
    RESERVED.iter().any(|k| token.is_keyword(k))
}

struct Parser<'t, 'a> {
    tokens: &'t [Token<'a>],
    /// Index of the matching parenthesis for every `(`
    pairs: Vec<Option<usize>>,
}

impl<'t, 'a> Parser<'t, 'a> {
    fn new(tokens: &'t [Token<'a>]) -> Result<Self> {
        let mut pairs = vec![None; tokens.len()];
        let mut stack = Vec::new();
        for (i, token) in tokens.iter().enumerate() {
            match token.kind {
                TokenKind::LParen => stack.push(i),
                TokenKind::RParen => {
                    let open = stack
                        .pop()
                        .ok_or_else(|| Error::parse("Unbalanced parentheses in query."))?;
                    pairs[open] = Some(i);
                }
                _ => {}
            }
        }
        if !stack.is_empty() {
            return Err(Error::parse("Unbalanced parentheses in query."));
        }
        Ok(Self { tokens, pairs })
    }

    fn at(&self, i: usize, hi: usize) -> Option<&Token<'a>> {
        if i < hi {
            self.tokens.get(i)
        } else {
            None
        }
    }

    fn kw(&self, i: usize, keyword: &str) -> bool {
        self.tokens.get(i).is_some_and(|t| t.is_keyword(keyword))
    }

    fn is(&self, i: usize, kind: TokenKind) -> bool {
        self.tokens.get(i).is_some_and(|t| t.kind == kind)
    }

    fn close(&self, open: usize) -> Result<usize> {
        self.pairs
            .get(open)
            .copied()
            .flatten()
            .ok_or_else(|| Error::parse("Unbalanced parentheses in query."))
    }

    fn unexpected(&self, i: usize) -> Error {
        match self.tokens.get(i) {
            Some(token) => Error::parse(format!("Syntax error near \"{}\".", token.text)),
            None => Error::parse("Unexpected end of query."),
        }
    }

    /// Byte range covered by tokens `lo..hi`; empty ranges sit after `lo - 1`
    fn bytes(&self, lo: usize, hi: usize) -> Range<usize> {
        if lo < hi {
            self.tokens[lo].start..self.tokens[hi - 1].end
        } else {
            let pos = lo
                .checked_sub(1)
                .and_then(|i| self.tokens.get(i))
                .map_or(0, |t| t.end);
            pos..pos
        }
    }

    fn starts_query(&self, i: usize) -> bool {
        if self.kw(i, "select") || self.kw(i, "with") {
            return true;
        }
        self.is(i, TokenKind::LParen) && self.starts_query(i + 1)
    }

    /// Statement verb, looking past parentheses and CTE definitions
    fn verb(&self) -> Result<String> {
        let mut i = 0;
        while self.is(i, TokenKind::LParen) {
            i += 1;
        }
        if self.kw(i, "with") {
            let (ctes, next) = self.cte_definitions(i, self.tokens.len())?;
            for (_, body) in ctes {
                if !self.starts_query(body.start) {
                    let verb = self
                        .tokens
                        .get(body.start)
                        .map_or_else(String::new, |t| t.text.to_ascii_uppercase());
                    return Err(not_allowed(&verb));
                }
            }
            i = next;
            while self.is(i, TokenKind::LParen) {
                i += 1;
            }
        }
        self.tokens
            .get(i)
            .map(|t| t.text.to_ascii_uppercase())
            .ok_or_else(|| Error::parse("Query is empty."))
    }

    /// `WITH [RECURSIVE] name [(cols)] AS [NOT] [MATERIALIZED] (body), ...`
    ///
    /// Returns the CTE names with their body token ranges and the index of
    /// the token following the definitions.
    fn cte_definitions(&self, lo: usize, hi: usize) -> Result<(Vec<(String, Range<usize>)>, usize)> {
        let mut i = lo + 1;
        if self.kw(i, "recursive") {
            i += 1;
        }
        let mut ctes = Vec::new();
        loop {
            let name = match self.at(i, hi) {
                Some(t) if t.is_identifier() => t.identifier(),
                _ => return Err(self.unexpected(i)),
            };
            i += 1;
            if self.is(i, TokenKind::LParen) {
                i = self.close(i)? + 1;
            }
            if !self.kw(i, "as") {
                return Err(self.unexpected(i));
            }
            i += 1;
            if self.kw(i, "not") {
                i += 1;
            }
            if self.kw(i, "materialized") {
                i += 1;
            }
            if !self.is(i, TokenKind::LParen) {
                return Err(self.unexpected(i));
            }
            let close = self.close(i)?;
            ctes.push((name, i + 1..close));
            i = close + 1;
            if self.is(i, TokenKind::Comma) && i < hi {
                i += 1;
                continue;
            }
            break;
        }
        Ok((ctes, i))
    }

    fn set_operator(&self, i: usize) -> Option<usize> {
        if !(self.kw(i, "union") || self.kw(i, "intersect") || self.kw(i, "except")) {
            return None;
        }
        if self.kw(i + 1, "all") || self.kw(i + 1, "distinct") {
            Some(i + 2)
        } else {
            Some(i + 1)
        }
    }

    fn parse_query(&self, lo: usize, hi: usize) -> Result<Select> {
        let first = self.at(lo, hi).ok_or_else(|| self.unexpected(lo))?;

        if first.kind == TokenKind::LParen {
            let close = self.close(lo)?;
            let mut inner = self.parse_query(lo + 1, close)?;
            if close + 1 == hi {
                return Ok(inner);
            }
            let operand_start = self
                .set_operator(close + 1)
                .ok_or_else(|| self.unexpected(close + 1))?;
            if inner.set_operation.is_some() {
                return Err(self.unexpected(close + 1));
            }
            inner.set_operation = Some(SetOperation {
                start: self.tokens[close + 1].start,
                operand: Box::new(self.parse_query(operand_start, hi)?),
            });
            inner.span = self.bytes(lo, hi);
            return Ok(inner);
        }

        if first.is_keyword("with") {
            let (definitions, next) = self.cte_definitions(lo, hi)?;
            let mut ctes = Vec::with_capacity(definitions.len());
            for (name, body) in definitions {
                if !self.starts_query(body.start) {
                    return Err(self.unexpected(body.start));
                }
                ctes.push(Cte {
                    name,
                    query: self.parse_query(body.start, body.end)?,
                });
            }
            let mut select = self.parse_query(next, hi)?;
            ctes.append(&mut select.ctes);
            select.ctes = ctes;
            select.span = self.bytes(lo, hi);
            return Ok(select);
        }

        if first.is_keyword("select") {
            return self.parse_select(lo, hi);
        }

        Err(self.unexpected(lo))
    }

    /// `a IS [NOT] DISTINCT FROM b` is an operator, not a FROM clause
    fn is_distinct_from(&self, from: usize) -> bool {
        from >= 2
            && self.kw(from - 1, "distinct")
            && (self.kw(from - 2, "is") || self.kw(from - 2, "not"))
    }

    fn clause_at(&self, i: usize) -> Option<(ClauseKind, usize)> {
        let token = &self.tokens[i];
        let kw = |k: &str| token.is_keyword(k);

        if kw("where") {
            Some((ClauseKind::Where, i + 1))
        } else if kw("group") && self.kw(i + 1, "by") {
            Some((ClauseKind::GroupBy, i + 2))
        } else if kw("having") {
            Some((ClauseKind::Having, i + 1))
        } else if kw("window") {
            Some((ClauseKind::Window, i + 1))
        } else if kw("order") && self.kw(i + 1, "by") {
            Some((ClauseKind::OrderBy, i + 2))
        } else if kw("limit") {
            Some((ClauseKind::Limit, i + 1))
        } else if kw("offset") {
            Some((ClauseKind::Offset, i + 1))
        } else if kw("fetch") && (self.kw(i + 1, "first") || self.kw(i + 1, "next")) {
            Some((ClauseKind::Fetch, i + 1))
        } else if kw("for")
            && ["update", "share", "no", "key"]
                .iter()
                .any(|k| self.kw(i + 1, k))
        {
            Some((ClauseKind::For, i + 1))
        } else {
            None
        }
    }

    fn parse_select(&self, lo: usize, hi: usize) -> Result<Select> {
        let mut from_at: Option<usize> = None;
        let mut boundaries: Vec<(ClauseKind, usize, usize)> = Vec::new();
        let mut set_op: Option<(usize, usize)> = None;

        let mut i = lo + 1;
        while i < hi {
            let token = &self.tokens[i];
            match token.kind {
                TokenKind::LParen => {
                    i = self.close(i)? + 1;
                    continue;
                }
                TokenKind::Word => {}
                _ => {
                    i += 1;
                    continue;
                }
            }
            if let Some(operand) = self.set_operator(i) {
                set_op = Some((i, operand));
                break;
            }
            if token.is_keyword("from")
                && from_at.is_none()
                && boundaries.is_empty()
                && !self.is_distinct_from(i)
            {
                from_at = Some(i);
                i += 1;
                continue;
            }
            if let Some((kind, body)) = self.clause_at(i) {
                boundaries.push((kind, i, body));
                i = body;
                continue;
            }
            i += 1;
        }

        let stop = set_op.map_or(hi, |(kw, _)| kw);
        let first_clause = boundaries.first().map_or(stop, |(_, kw, _)| *kw);
        let projection_end = from_at.unwrap_or(first_clause);

        self.reject_select_into(lo + 1, projection_end)?;

        let mut subqueries = Vec::new();
        self.collect_subqueries(lo + 1, projection_end, &mut subqueries)?;

        let from = match from_at {
            Some(kw) => {
                let (items, join_subqueries) = self.parse_from(kw + 1, first_clause)?;
                subqueries.extend(join_subqueries);
                Some(FromClause {
                    start: self.tokens[kw].start,
                    items,
                })
            }
            None => None,
        };

        let own_end = self.bytes(lo, stop).end;
        let mut clauses = Vec::with_capacity(boundaries.len());
        let mut limit = None;
        for (n, &(kind, kw, body)) in boundaries.iter().enumerate() {
            let (body_end, end) = match boundaries.get(n + 1) {
                Some(&(_, next_kw, _)) => (next_kw, self.tokens[next_kw].start),
                None => (stop, own_end),
            };
            self.collect_subqueries(body, body_end, &mut subqueries)?;
            if kind == ClauseKind::Limit {
                limit = self
                    .at(body, body_end)
                    .filter(|t| t.kind == TokenKind::Number)
                    .and_then(|t| t.text.parse().ok());
            }
            clauses.push(Clause {
                kind,
                start: self.tokens[kw].start,
                body: self.bytes(body, body_end),
                end,
            });
        }

        let set_operation = match set_op {
            Some((kw, operand)) => Some(SetOperation {
                start: self.tokens[kw].start,
                operand: Box::new(self.parse_query(operand, hi)?),
            }),
            None => None,
        };

        Ok(Select {
            span: self.bytes(lo, hi),
            end: own_end,
            projection: self.bytes(lo + 1, projection_end),
            from,
            clauses,
            limit,
            ctes: Vec::new(),
            subqueries,
            set_operation,
        })
    }

    fn reject_select_into(&self, lo: usize, hi: usize) -> Result<()> {
        let mut i = lo;
        while i < hi {
            if self.is(i, TokenKind::LParen) {
                i = self.close(i)? + 1;
                continue;
            }
            if self.kw(i, "into") {
                return Err(not_allowed("SELECT INTO"));
            }
            i += 1;
        }
        Ok(())
    }

    fn collect_subqueries(&self, lo: usize, hi: usize, out: &mut Vec<Select>) -> Result<()> {
        let mut i = lo;
        while i < hi {
            if self.is(i, TokenKind::LParen) && self.starts_query(i + 1) {
                let close = self.close(i)?;
                out.push(self.parse_query(i + 1, close)?);
                i = close + 1;
                continue;
            }
            i += 1;
        }
        Ok(())
    }

    fn parse_from(&self, lo: usize, hi: usize) -> Result<(Vec<FromItem>, Vec<Select>)> {
        let mut items = Vec::new();
        let mut subqueries = Vec::new();
        let mut i = lo;

        while i < hi {
            let item_start = i;
            while self.kw(i, "lateral") || self.kw(i, "only") {
                i += 1;
            }
            let token = self.at(i, hi).ok_or_else(|| self.unexpected(i))?;

            let (source, after) = match token.kind {
                TokenKind::LParen => {
                    let close = self.close(i)?;
                    if self.starts_query(i + 1) {
                        let query = self.parse_query(i + 1, close)?;
                        (Some(FromSource::Subquery(Box::new(query))), close + 1)
                    } else if self.kw(i + 1, "values") {
                        self.collect_subqueries(i + 1, close, &mut subqueries)?;
                        (Some(FromSource::Values), close + 1)
                    } else {
                        // Parenthesised join tree
                        let (nested, nested_subqueries) = self.parse_from(i + 1, close)?;
                        items.extend(nested);
                        subqueries.extend(nested_subqueries);
                        (None, close + 1)
                    }
                }
                _ if token.is_identifier() => {
                    let mut parts = vec![token.identifier()];
                    let mut j = i + 1;
                    while self.at(j, hi).is_some_and(|t| t.kind == TokenKind::Dot)
                        && self.at(j + 1, hi).is_some_and(Token::is_identifier)
                    {
                        parts.push(self.tokens[j + 1].identifier());
                        j += 2;
                    }
                    let name_span = self.bytes(i, j);
                    let name = parts.pop().unwrap_or_default();

                    if self.at(j, hi).is_some_and(|t| t.kind == TokenKind::LParen) {
                        let close = self.close(j)?;
                        self.collect_subqueries(j + 1, close, &mut subqueries)?;
                        let mut next = close + 1;
                        if self.kw(next, "with") && self.kw(next + 1, "ordinality") {
                            next += 2;
                        }
                        (Some(FromSource::Function { name }), next)
                    } else {
                        let schema = (!parts.is_empty()).then(|| parts.join("."));
                        (
                            Some(FromSource::Table {
                                name,
                                schema,
                                span: name_span,
                            }),
                            j,
                        )
                    }
                }
                _ => return Err(self.unexpected(i)),
            };

            let (alias, mut j) = self.parse_alias(after, hi)?;
            if let Some(source) = source {
                items.push(FromItem {
                    span: self.bytes(item_start, j),
                    source,
                    alias,
                });
            }

            if self
                .at(j, hi)
                .is_some_and(|t| t.is_keyword("on") || t.is_keyword("using"))
            {
                let condition_start = j + 1;
                let mut k = condition_start;
                while let Some(t) = self.at(k, hi) {
                    if t.kind == TokenKind::Comma || is_join_start(t) {
                        break;
                    }
                    k = if t.kind == TokenKind::LParen {
                        self.close(k)? + 1
                    } else {
                        k + 1
                    };
                }
                self.collect_subqueries(condition_start, k, &mut subqueries)?;
                j = k;
            }

            match self.at(j, hi) {
                None => break,
                Some(t) if t.kind == TokenKind::Comma => i = j + 1,
                Some(t) if is_join_start(t) => {
                    let mut k = j;
                    while let Some(t) = self.at(k, hi) {
                        if !(is_join_start(t) || t.is_keyword("outer")) {
                            break;
                        }
                        k += 1;
                        if t.is_keyword("join") {
                            break;
                        }
                    }
                    i = k;
                }
                Some(_) => return Err(self.unexpected(j)),
            }
        }

        Ok((items, subqueries))
    }

    fn parse_alias(&self, i: usize, hi: usize) -> Result<(Option<String>, usize)> {
        let mut j = i;
        let explicit = self.at(j, hi).is_some_and(|t| t.is_keyword("as"));
        if explicit {
            j += 1;
        }
        match self.at(j, hi) {
            Some(t)
                if t.is_identifier()
                    && (explicit || t.kind == TokenKind::QuotedIdent || !is_reserved(t)) =>
            {
                let alias = t.identifier();
                j += 1;
                if self.at(j, hi).is_some_and(|t| t.kind == TokenKind::LParen) {
                    j = self.close(j)? + 1;
                }
                Ok((Some(alias), j))
            }
            _ if explicit => Err(self.unexpected(j)),
            _ => Ok((None, j)),
        }
    }
}
