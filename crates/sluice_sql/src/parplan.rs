//! The parser/planner seam.
//!
//! SQL text is parsed by the embedded `sqlparser` library; this module
//! lowers the AST into the small physical-plan algebra the engines execute
//! (scan, filter, project, aggregate, limit) and parses the DDL dialect
//! (`CREATE SOURCE`, `CREATE MATERIALIZED VIEW`, `DROP ...`). Source DDL is
//! rewritten textually onto the library's `CREATE TABLE` grammar before
//! parsing so the option syntax stays standard.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use sqlparser::ast::{
    BinaryOperator, ColumnOption, DataType, ExactNumberInfo, Expr as SqlExpr, FunctionArg,
    FunctionArgExpr, FunctionArguments, GroupByExpr, ObjectName, Query, Select, SelectItem,
    SetExpr, Statement, TableConstraint, TableFactor, UnaryOperator, Value as SqlValue,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

use sluice_core::schema::TableInfo;
use sluice_core::types::{ColumnType, Datum, Row};
use sluice_core::{SluiceError, SluiceResult};

use crate::aggfuncs::AggFunctionType;
use crate::TableResolver;

/// Binary operators supported by the expression evaluator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
    Plus,
    Minus,
    Multiply,
    Divide,
}

/// A compiled scalar expression over one input row.
#[derive(Clone, Debug, PartialEq)]
pub enum PlanExpr {
    Column(usize),
    Literal(Option<Datum>),
    BinaryOp {
        op: BinOp,
        left: Box<PlanExpr>,
        right: Box<PlanExpr>,
    },
}

impl PlanExpr {
    /// Evaluate against a row; `None` is SQL NULL.
    pub fn eval(&self, row: &Row) -> anyhow::Result<Option<Datum>> {
        match self {
            PlanExpr::Column(i) => Ok(row.get(*i).cloned()),
            PlanExpr::Literal(v) => Ok(v.clone()),
            PlanExpr::BinaryOp { op, left, right } => {
                let l = left.eval(row)?;
                let r = right.eval(row)?;
                eval_binary(*op, l, r)
            }
        }
    }

    /// Evaluate as a predicate; NULL is false.
    pub fn eval_bool(&self, row: &Row) -> anyhow::Result<bool> {
        Ok(matches!(self.eval(row)?, Some(Datum::Int(v)) if v != 0))
    }

    /// Static result type given the input schema.
    pub fn result_type(&self, input_types: &[ColumnType]) -> anyhow::Result<ColumnType> {
        match self {
            PlanExpr::Column(i) => input_types
                .get(*i)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("column {i} out of range")),
            PlanExpr::Literal(v) => Ok(match v {
                Some(Datum::Int(_)) | None => ColumnType::BigInt,
                Some(Datum::Double(_)) => ColumnType::Double,
                Some(Datum::Varchar(_)) => ColumnType::Varchar,
                Some(Datum::Decimal(d)) => ColumnType::Decimal {
                    precision: 38,
                    scale: d.scale() as u8,
                },
                Some(Datum::Timestamp(_)) => ColumnType::Timestamp,
            }),
            PlanExpr::BinaryOp { op, left, right } => match op {
                BinOp::Eq
                | BinOp::NotEq
                | BinOp::Lt
                | BinOp::LtEq
                | BinOp::Gt
                | BinOp::GtEq
                | BinOp::And
                | BinOp::Or => Ok(ColumnType::TinyInt),
                _ => {
                    let l = left.result_type(input_types)?;
                    let r = right.result_type(input_types)?;
                    Ok(promote_types(&l, &r))
                }
            },
        }
    }
}

fn promote_types(l: &ColumnType, r: &ColumnType) -> ColumnType {
    use ColumnType::*;
    match (l, r) {
        (Double, _) | (_, Double) => Double,
        (Decimal { .. }, _) => l.clone(),
        (_, Decimal { .. }) => r.clone(),
        (BigInt, _) | (_, BigInt) => BigInt,
        _ => l.clone(),
    }
}

fn cmp_datums(l: &Datum, r: &Datum) -> anyhow::Result<Ordering> {
    let ord = match (l, r) {
        (Datum::Int(a), Datum::Int(b)) => a.cmp(b),
        (Datum::Double(a), Datum::Double(b)) => a
            .partial_cmp(b)
            .ok_or_else(|| anyhow::anyhow!("NaN in comparison"))?,
        (Datum::Int(a), Datum::Double(b)) => (*a as f64)
            .partial_cmp(b)
            .ok_or_else(|| anyhow::anyhow!("NaN in comparison"))?,
        (Datum::Double(a), Datum::Int(b)) => a
            .partial_cmp(&(*b as f64))
            .ok_or_else(|| anyhow::anyhow!("NaN in comparison"))?,
        (Datum::Decimal(a), Datum::Decimal(b)) => a.cmp(b),
        (Datum::Decimal(a), Datum::Int(b)) => a.cmp(&Decimal::from(*b)),
        (Datum::Int(a), Datum::Decimal(b)) => Decimal::from(*a).cmp(b),
        (Datum::Varchar(a), Datum::Varchar(b)) => a.cmp(b),
        (Datum::Timestamp(a), Datum::Timestamp(b)) => a.cmp(b),
        (Datum::Timestamp(a), Datum::Int(b)) => a.cmp(b),
        (Datum::Int(a), Datum::Timestamp(b)) => a.cmp(b),
        _ => anyhow::bail!("cannot compare {l:?} with {r:?}"),
    };
    Ok(ord)
}

fn bool_datum(v: bool) -> Option<Datum> {
    Some(Datum::Int(v as i64))
}

fn eval_binary(
    op: BinOp,
    l: Option<Datum>,
    r: Option<Datum>,
) -> anyhow::Result<Option<Datum>> {
    if matches!(op, BinOp::And | BinOp::Or) {
        let lb = matches!(&l, Some(Datum::Int(v)) if *v != 0);
        let rb = matches!(&r, Some(Datum::Int(v)) if *v != 0);
        return Ok(bool_datum(match op {
            BinOp::And => lb && rb,
            _ => lb || rb,
        }));
    }
    // NULL propagates through comparisons and arithmetic.
    let (Some(l), Some(r)) = (l, r) else {
        return Ok(None);
    };
    match op {
        BinOp::Eq => Ok(bool_datum(cmp_datums(&l, &r)? == Ordering::Equal)),
        BinOp::NotEq => Ok(bool_datum(cmp_datums(&l, &r)? != Ordering::Equal)),
        BinOp::Lt => Ok(bool_datum(cmp_datums(&l, &r)? == Ordering::Less)),
        BinOp::LtEq => Ok(bool_datum(cmp_datums(&l, &r)? != Ordering::Greater)),
        BinOp::Gt => Ok(bool_datum(cmp_datums(&l, &r)? == Ordering::Greater)),
        BinOp::GtEq => Ok(bool_datum(cmp_datums(&l, &r)? != Ordering::Less)),
        BinOp::Plus | BinOp::Minus | BinOp::Multiply | BinOp::Divide => arith(op, l, r),
        BinOp::And | BinOp::Or => unreachable!(),
    }
}

fn arith(op: BinOp, l: Datum, r: Datum) -> anyhow::Result<Option<Datum>> {
    use Datum::*;
    let out = match (l, r) {
        (Int(a), Int(b)) => match op {
            BinOp::Plus => Int(a.wrapping_add(b)),
            BinOp::Minus => Int(a.wrapping_sub(b)),
            BinOp::Multiply => Int(a.wrapping_mul(b)),
            BinOp::Divide => {
                if b == 0 {
                    return Ok(None);
                }
                Int(a / b)
            }
            _ => unreachable!(),
        },
        (l, r) => {
            let a = to_f64(&l)?;
            let b = to_f64(&r)?;
            match op {
                BinOp::Plus => Double(a + b),
                BinOp::Minus => Double(a - b),
                BinOp::Multiply => Double(a * b),
                BinOp::Divide => Double(a / b),
                _ => unreachable!(),
            }
        }
    };
    Ok(Some(out))
}

fn to_f64(d: &Datum) -> anyhow::Result<f64> {
    match d {
        Datum::Int(v) => Ok(*v as f64),
        Datum::Double(v) => Ok(*v),
        Datum::Decimal(v) => Ok(v.to_string().parse::<f64>()?),
        other => anyhow::bail!("cannot use {other:?} in arithmetic"),
    }
}

/// One aggregate call in an aggregate plan node.
#[derive(Clone, Debug, PartialEq)]
pub struct AggregateCall {
    pub func: AggFunctionType,
    pub arg: Option<PlanExpr>,
    pub return_type: ColumnType,
}

/// The physical-plan algebra both engines consume.
#[derive(Clone, Debug, PartialEq)]
pub enum PhysicalPlan {
    TableScan {
        table: TableInfo,
    },
    Filter {
        pred: PlanExpr,
        input: Box<PhysicalPlan>,
    },
    Project {
        exprs: Vec<PlanExpr>,
        input: Box<PhysicalPlan>,
    },
    Aggregate {
        group_by: Vec<usize>,
        calls: Vec<AggregateCall>,
        input: Box<PhysicalPlan>,
    },
    Limit {
        limit: usize,
        input: Box<PhysicalPlan>,
    },
}

/// A lowered query: the plan plus its output schema.
#[derive(Clone, Debug)]
pub struct PlannedQuery {
    pub plan: PhysicalPlan,
    pub col_names: Vec<String>,
    pub col_types: Vec<ColumnType>,
    /// Output positions of the group-by columns, present for aggregate
    /// plans; they become the primary key of a materialized view.
    pub group_cols: Option<Vec<usize>>,
}

/// A parsed DDL statement.
#[derive(Clone, Debug, PartialEq)]
pub enum DdlStatement {
    CreateSource {
        name: String,
        column_names: Vec<String>,
        column_types: Vec<ColumnType>,
        primary_key_cols: Vec<usize>,
        options: BTreeMap<String, String>,
    },
    CreateMaterializedView {
        name: String,
        query: String,
    },
    DropSource {
        name: String,
    },
    DropMaterializedView {
        name: String,
    },
}

/// Either a DDL statement or a query to run on the pull engine.
#[derive(Clone, Debug)]
pub enum ParsedStatement {
    Ddl(DdlStatement),
    Query(String),
}

fn invalid(msg: impl Into<String>) -> SluiceError {
    SluiceError::InvalidStatement(msg.into())
}

fn strip_leading_word(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    if s.is_empty() {
        return None;
    }
    let end = s.find(char::is_whitespace).unwrap_or(s.len());
    Some((&s[..end], s[end..].trim_start()))
}

/// Classify a statement and rewrite the Sluice-specific DDL keywords onto
/// the library grammar.
pub fn parse_statement(sql: &str) -> SluiceResult<ParsedStatement> {
    let Some((first, rest)) = strip_leading_word(sql) else {
        return Err(invalid("empty statement"));
    };
    if first.eq_ignore_ascii_case("create") {
        let Some((second, rest2)) = strip_leading_word(rest) else {
            return Err(invalid(sql));
        };
        if second.eq_ignore_ascii_case("source") {
            return parse_create_source(&format!("CREATE TABLE {rest2}"));
        }
        if second.eq_ignore_ascii_case("materialized") {
            return parse_create_mv(sql);
        }
        return Err(invalid(format!("unsupported CREATE statement: {sql}")));
    }
    if first.eq_ignore_ascii_case("drop") {
        let Some((second, rest2)) = strip_leading_word(rest) else {
            return Err(invalid(sql));
        };
        if second.eq_ignore_ascii_case("source") {
            let name = object_name_str(rest2)?;
            return Ok(ParsedStatement::Ddl(DdlStatement::DropSource { name }));
        }
        if second.eq_ignore_ascii_case("materialized") {
            let Some((third, rest3)) = strip_leading_word(rest2) else {
                return Err(invalid(sql));
            };
            if !third.eq_ignore_ascii_case("view") {
                return Err(invalid(sql));
            }
            let name = object_name_str(rest3)?;
            return Ok(ParsedStatement::Ddl(DdlStatement::DropMaterializedView {
                name,
            }));
        }
        return Err(invalid(format!("unsupported DROP statement: {sql}")));
    }
    Ok(ParsedStatement::Query(sql.to_string()))
}

fn object_name_str(raw: &str) -> SluiceResult<String> {
    let name = raw.trim().trim_end_matches(';').trim();
    if name.is_empty() || name.contains(char::is_whitespace) {
        return Err(invalid(format!("bad object name {raw:?}")));
    }
    Ok(name.to_lowercase())
}

fn parse_one(sql: &str) -> SluiceResult<Statement> {
    let mut statements = Parser::parse_sql(&GenericDialect {}, sql)
        .map_err(|e| invalid(e.to_string()))?;
    if statements.len() != 1 {
        return Err(invalid(format!(
            "expected 1 statement, got {}",
            statements.len()
        )));
    }
    Ok(statements.remove(0))
}

fn parse_create_source(rewritten: &str) -> SluiceResult<ParsedStatement> {
    let statement = parse_one(rewritten)?;
    let Statement::CreateTable {
        name,
        columns,
        constraints,
        with_options,
        ..
    } = statement
    else {
        return Err(invalid(format!("not a create source: {rewritten}")));
    };
    let name = last_name(&name);
    let mut column_names = Vec::with_capacity(columns.len());
    let mut column_types = Vec::with_capacity(columns.len());
    let mut primary_key_cols = Vec::new();
    for (i, col) in columns.iter().enumerate() {
        column_names.push(col.name.value.to_lowercase());
        column_types.push(convert_data_type(&col.data_type)?);
        for opt in &col.options {
            if matches!(opt.option, ColumnOption::Unique { is_primary: true, .. }) {
                primary_key_cols.push(i);
            }
        }
    }
    for constraint in &constraints {
        if let TableConstraint::PrimaryKey { columns: pk, .. } = constraint {
            for ident in pk {
                let col = ident.value.to_lowercase();
                let idx = column_names
                    .iter()
                    .position(|n| *n == col)
                    .ok_or_else(|| invalid(format!("unknown primary key column {col}")))?;
                primary_key_cols.push(idx);
            }
        }
    }
    if primary_key_cols.is_empty() {
        return Err(invalid("a source requires a primary key"));
    }
    let mut options = BTreeMap::new();
    for opt in with_options {
        let value = match opt.value {
            SqlExpr::Value(SqlValue::SingleQuotedString(s)) => s,
            SqlExpr::Value(SqlValue::Number(s, _)) => s,
            other => return Err(invalid(format!("bad option value {other}"))),
        };
        options.insert(opt.name.value.to_lowercase(), value);
    }
    Ok(ParsedStatement::Ddl(DdlStatement::CreateSource {
        name,
        column_names,
        column_types,
        primary_key_cols,
        options,
    }))
}

fn parse_create_mv(sql: &str) -> SluiceResult<ParsedStatement> {
    let statement = parse_one(sql)?;
    let Statement::CreateView {
        name,
        materialized: true,
        query,
        ..
    } = statement
    else {
        return Err(invalid(format!("not a create materialized view: {sql}")));
    };
    Ok(ParsedStatement::Ddl(DdlStatement::CreateMaterializedView {
        name: last_name(&name),
        query: query.to_string(),
    }))
}

fn last_name(name: &ObjectName) -> String {
    name.0
        .last()
        .map(|ident| ident.value.to_lowercase())
        .unwrap_or_default()
}

fn convert_data_type(dt: &DataType) -> SluiceResult<ColumnType> {
    let ct = match dt {
        DataType::TinyInt(_) => ColumnType::TinyInt,
        DataType::Int(_) | DataType::Integer(_) => ColumnType::Int,
        DataType::BigInt(_) => ColumnType::BigInt,
        DataType::Double | DataType::DoublePrecision => ColumnType::Double,
        DataType::Varchar(_) | DataType::Text => ColumnType::Varchar,
        DataType::Decimal(info) | DataType::Numeric(info) => match info {
            ExactNumberInfo::PrecisionAndScale(p, s) => ColumnType::Decimal {
                precision: *p as u8,
                scale: *s as u8,
            },
            ExactNumberInfo::Precision(p) => ColumnType::Decimal {
                precision: *p as u8,
                scale: 0,
            },
            ExactNumberInfo::None => ColumnType::Decimal {
                precision: 38,
                scale: 10,
            },
        },
        DataType::Timestamp(_, _) | DataType::Datetime(_) => ColumnType::Timestamp,
        other => return Err(invalid(format!("unsupported column type {other}"))),
    };
    Ok(ct)
}

/// Lowers parsed queries into physical plans against the catalog.
pub struct Planner {
    resolver: Arc<dyn TableResolver>,
}

impl Planner {
    pub fn new(resolver: Arc<dyn TableResolver>) -> Self {
        Self { resolver }
    }

    /// Plan a `SELECT` for execution.
    pub fn plan_query(&self, schema_name: &str, sql: &str) -> SluiceResult<PlannedQuery> {
        let statement = parse_one(sql)?;
        let Statement::Query(query) = statement else {
            return Err(invalid(format!("not a query: {sql}")));
        };
        self.plan_parsed_query(schema_name, &query)
    }

    fn plan_parsed_query(&self, schema_name: &str, query: &Query) -> SluiceResult<PlannedQuery> {
        let SetExpr::Select(select) = query.body.as_ref() else {
            return Err(invalid("only plain SELECT queries are supported"));
        };
        let (mut plan, names, types) = self.plan_select_input(schema_name, select)?;

        let group_exprs = match &select.group_by {
            GroupByExpr::Expressions(exprs) => exprs.clone(),
            GroupByExpr::All => {
                return Err(invalid("GROUP BY ALL is not supported"));
            }
        };
        let has_aggs = select.projection.iter().any(|item| {
            matches!(
                item_expr(item),
                Some(SqlExpr::Function(f)) if agg_type_of(f).is_some()
            )
        });

        let planned = if !group_exprs.is_empty() || has_aggs {
            let (plan, col_names, col_types, group_cols) =
                plan_aggregate(plan, &names, &types, select, &group_exprs)?;
            PlannedQuery {
                plan,
                col_names,
                col_types,
                group_cols: Some(group_cols),
            }
        } else {
            let (exprs, col_names, col_types) =
                plan_projection(&select.projection, &names, &types)?;
            if let Some(exprs) = exprs {
                plan = PhysicalPlan::Project {
                    exprs,
                    input: Box::new(plan),
                };
            }
            PlannedQuery {
                plan,
                col_names,
                col_types,
                group_cols: None,
            }
        };

        let planned = match &query.limit {
            Some(SqlExpr::Value(SqlValue::Number(n, _))) => {
                let limit = n
                    .parse::<usize>()
                    .map_err(|_| invalid(format!("bad limit {n}")))?;
                PlannedQuery {
                    plan: PhysicalPlan::Limit {
                        limit,
                        input: Box::new(planned.plan),
                    },
                    ..planned
                }
            }
            Some(other) => return Err(invalid(format!("bad limit {other}"))),
            None => planned,
        };
        Ok(planned)
    }

    fn plan_select_input(
        &self,
        schema_name: &str,
        select: &Select,
    ) -> SluiceResult<(PhysicalPlan, Vec<String>, Vec<ColumnType>)> {
        if select.from.len() != 1 || !select.from[0].joins.is_empty() {
            return Err(invalid("queries must read exactly one table"));
        }
        let TableFactor::Table { name, .. } = &select.from[0].relation else {
            return Err(invalid("queries must read a named table"));
        };
        let (schema_name, table_name) = match name.0.as_slice() {
            [table] => (schema_name.to_string(), table.value.to_lowercase()),
            [schema, table] => (schema.value.to_lowercase(), table.value.to_lowercase()),
            _ => return Err(invalid(format!("bad table name {name}"))),
        };
        let table = self.resolver.resolve_table(&schema_name, &table_name)?;
        let names = table.column_names.clone();
        let types = table.column_types.clone();
        let mut plan = PhysicalPlan::TableScan { table };
        if let Some(selection) = &select.selection {
            let pred = convert_expr(selection, &names)?;
            plan = PhysicalPlan::Filter {
                pred,
                input: Box::new(plan),
            };
        }
        Ok((plan, names, types))
    }
}

fn item_expr(item: &SelectItem) -> Option<&SqlExpr> {
    match item {
        SelectItem::UnnamedExpr(e) => Some(e),
        SelectItem::ExprWithAlias { expr, .. } => Some(expr),
        _ => None,
    }
}

fn item_name(item: &SelectItem, expr: &SqlExpr) -> String {
    match item {
        SelectItem::ExprWithAlias { alias, .. } => alias.value.to_lowercase(),
        _ => match expr {
            SqlExpr::Identifier(ident) => ident.value.to_lowercase(),
            SqlExpr::CompoundIdentifier(parts) => parts
                .last()
                .map(|i| i.value.to_lowercase())
                .unwrap_or_default(),
            other => other.to_string().to_lowercase(),
        },
    }
}

fn agg_type_of(f: &sqlparser::ast::Function) -> Option<AggFunctionType> {
    let name = f.name.0.last()?.value.to_lowercase();
    match name.as_str() {
        "sum" => Some(AggFunctionType::Sum),
        "count" => Some(AggFunctionType::Count),
        "min" => Some(AggFunctionType::Min),
        "max" => Some(AggFunctionType::Max),
        _ => None,
    }
}

fn agg_arg(f: &sqlparser::ast::Function) -> SluiceResult<Option<SqlExpr>> {
    match &f.args {
        FunctionArguments::None => Ok(None),
        FunctionArguments::List(list) => match list.args.as_slice() {
            [] => Ok(None),
            [FunctionArg::Unnamed(FunctionArgExpr::Wildcard)] => Ok(None),
            [FunctionArg::Unnamed(FunctionArgExpr::Expr(e))] => Ok(Some(e.clone())),
            _ => Err(invalid(format!("unsupported aggregate arguments in {f}"))),
        },
        FunctionArguments::Subquery(_) => {
            Err(invalid("subquery aggregate arguments are not supported"))
        }
    }
}

fn sum_return_type(arg: &ColumnType) -> ColumnType {
    match arg {
        ColumnType::TinyInt | ColumnType::Int | ColumnType::BigInt => ColumnType::BigInt,
        other => other.clone(),
    }
}

// Group-by columns become first-row aggregate calls, so the aggregate's
// output covers the whole select list and the group key doubles as the
// view's primary key.
fn plan_aggregate(
    input: PhysicalPlan,
    names: &[String],
    types: &[ColumnType],
    select: &Select,
    group_exprs: &[SqlExpr],
) -> SluiceResult<(PhysicalPlan, Vec<String>, Vec<ColumnType>, Vec<usize>)> {
    let mut group_by = Vec::with_capacity(group_exprs.len());
    for expr in group_exprs {
        match convert_expr(expr, names)? {
            PlanExpr::Column(i) => group_by.push(i),
            other => {
                return Err(invalid(format!(
                    "GROUP BY must reference columns, got {other:?}"
                )))
            }
        }
    }

    let mut calls = Vec::new();
    let mut col_names = Vec::new();
    let mut col_types = Vec::new();
    let mut group_cols = Vec::new();
    let mut seen_agg = false;
    for item in &select.projection {
        let Some(expr) = item_expr(item) else {
            return Err(invalid("SELECT * is not supported with GROUP BY"));
        };
        match expr {
            SqlExpr::Function(f) if agg_type_of(f).is_some() => {
                let func = agg_type_of(f).expect("checked above");
                let arg = match agg_arg(f)? {
                    Some(e) => Some(convert_expr(&e, names)?),
                    None if func == AggFunctionType::Count => None,
                    None => {
                        return Err(invalid(format!("{f} requires an argument")))
                    }
                };
                let return_type = match (&func, &arg) {
                    (AggFunctionType::Count, _) => ColumnType::BigInt,
                    (AggFunctionType::Sum, Some(a)) => {
                        sum_return_type(&a.result_type(types).map_err(|e| invalid(e.to_string()))?)
                    }
                    (_, Some(a)) => a.result_type(types).map_err(|e| invalid(e.to_string()))?,
                    _ => return Err(invalid(format!("{f} requires an argument"))),
                };
                col_names.push(item_name(item, expr));
                col_types.push(return_type.clone());
                calls.push(AggregateCall {
                    func,
                    arg,
                    return_type,
                });
                seen_agg = true;
            }
            _ => {
                let converted = convert_expr(expr, names)?;
                let PlanExpr::Column(i) = converted else {
                    return Err(invalid(
                        "non-aggregate select items must be group by columns",
                    ));
                };
                if !group_by.contains(&i) {
                    return Err(invalid(format!(
                        "column {} must appear in GROUP BY",
                        names[i]
                    )));
                }
                if seen_agg {
                    // Keeps the group key a prefix of the output so it can
                    // serve as the view's primary key without a reorder.
                    return Err(invalid(
                        "group by columns must come before aggregates in the select list",
                    ));
                }
                group_cols.push(calls.len());
                col_names.push(item_name(item, expr));
                col_types.push(types[i].clone());
                calls.push(AggregateCall {
                    func: AggFunctionType::FirstRow,
                    arg: Some(PlanExpr::Column(i)),
                    return_type: types[i].clone(),
                });
            }
        }
    }
    if calls.is_empty() {
        return Err(invalid("empty select list"));
    }
    let plan = PhysicalPlan::Aggregate {
        group_by,
        calls,
        input: Box::new(input),
    };
    Ok((plan, col_names, col_types, group_cols))
}

#[allow(clippy::type_complexity)]
fn plan_projection(
    projection: &[SelectItem],
    names: &[String],
    types: &[ColumnType],
) -> SluiceResult<(Option<Vec<PlanExpr>>, Vec<String>, Vec<ColumnType>)> {
    // SELECT * keeps the scan output as-is.
    if projection.len() == 1 && matches!(projection[0], SelectItem::Wildcard(_)) {
        return Ok((None, names.to_vec(), types.to_vec()));
    }
    let mut exprs = Vec::with_capacity(projection.len());
    let mut col_names = Vec::with_capacity(projection.len());
    let mut col_types = Vec::with_capacity(projection.len());
    for item in projection {
        let Some(expr) = item_expr(item) else {
            return Err(invalid("unsupported select item"));
        };
        let converted = convert_expr(expr, names)?;
        col_types.push(
            converted
                .result_type(types)
                .map_err(|e| invalid(e.to_string()))?,
        );
        col_names.push(item_name(item, expr));
        exprs.push(converted);
    }
    // An identity projection still narrows/naming-normalizes the output.
    Ok((Some(exprs), col_names, col_types))
}

/// Convert a parsed scalar expression, resolving identifiers against the
/// input column names.
pub fn convert_expr(expr: &SqlExpr, names: &[String]) -> SluiceResult<PlanExpr> {
    match expr {
        SqlExpr::Identifier(ident) => resolve_column(&ident.value, names),
        SqlExpr::CompoundIdentifier(parts) => {
            let ident = parts
                .last()
                .ok_or_else(|| invalid("empty compound identifier"))?;
            resolve_column(&ident.value, names)
        }
        SqlExpr::Value(value) => convert_value(value),
        SqlExpr::Nested(inner) => convert_expr(inner, names),
        SqlExpr::UnaryOp {
            op: UnaryOperator::Minus,
            expr,
        } => match convert_expr(expr, names)? {
            PlanExpr::Literal(Some(Datum::Int(v))) => Ok(PlanExpr::Literal(Some(Datum::Int(-v)))),
            PlanExpr::Literal(Some(Datum::Double(v))) => {
                Ok(PlanExpr::Literal(Some(Datum::Double(-v))))
            }
            other => Ok(PlanExpr::BinaryOp {
                op: BinOp::Minus,
                left: Box::new(PlanExpr::Literal(Some(Datum::Int(0)))),
                right: Box::new(other),
            }),
        },
        SqlExpr::BinaryOp { left, op, right } => {
            let op = match op {
                BinaryOperator::Eq => BinOp::Eq,
                BinaryOperator::NotEq => BinOp::NotEq,
                BinaryOperator::Lt => BinOp::Lt,
                BinaryOperator::LtEq => BinOp::LtEq,
                BinaryOperator::Gt => BinOp::Gt,
                BinaryOperator::GtEq => BinOp::GtEq,
                BinaryOperator::And => BinOp::And,
                BinaryOperator::Or => BinOp::Or,
                BinaryOperator::Plus => BinOp::Plus,
                BinaryOperator::Minus => BinOp::Minus,
                BinaryOperator::Multiply => BinOp::Multiply,
                BinaryOperator::Divide => BinOp::Divide,
                other => return Err(invalid(format!("unsupported operator {other}"))),
            };
            Ok(PlanExpr::BinaryOp {
                op,
                left: Box::new(convert_expr(left, names)?),
                right: Box::new(convert_expr(right, names)?),
            })
        }
        other => Err(invalid(format!("unsupported expression {other}"))),
    }
}

fn resolve_column(name: &str, names: &[String]) -> SluiceResult<PlanExpr> {
    let lowered = name.to_lowercase();
    names
        .iter()
        .position(|n| n.to_lowercase() == lowered)
        .map(PlanExpr::Column)
        .ok_or_else(|| invalid(format!("unknown column {name}")))
}

fn convert_value(value: &SqlValue) -> SluiceResult<PlanExpr> {
    let datum = match value {
        SqlValue::Number(text, _) => {
            if text.contains('.') || text.contains('e') || text.contains('E') {
                Some(Datum::Double(
                    text.parse::<f64>()
                        .map_err(|_| invalid(format!("bad number {text}")))?,
                ))
            } else {
                Some(Datum::Int(
                    text.parse::<i64>()
                        .map_err(|_| invalid(format!("bad number {text}")))?,
                ))
            }
        }
        SqlValue::SingleQuotedString(s) => Some(Datum::Varchar(s.clone())),
        SqlValue::Boolean(b) => Some(Datum::Int(*b as i64)),
        SqlValue::Null => None,
        other => return Err(invalid(format!("unsupported literal {other}"))),
    };
    Ok(PlanExpr::Literal(datum))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::schema::USER_TABLE_ID_BASE;

    struct FixedResolver {
        table: TableInfo,
    }

    impl TableResolver for FixedResolver {
        fn resolve_table(&self, _schema: &str, name: &str) -> SluiceResult<TableInfo> {
            if name == self.table.name {
                Ok(self.table.clone())
            } else {
                Err(SluiceError::table_not_exists("test", name))
            }
        }
    }

    fn planner() -> Planner {
        Planner::new(Arc::new(FixedResolver {
            table: TableInfo {
                id: USER_TABLE_ID_BASE,
                schema_name: "test".into(),
                name: "orders".into(),
                primary_key_cols: vec![0],
                column_names: vec!["id".into(), "customer".into(), "amount".into()],
                column_types: vec![ColumnType::BigInt, ColumnType::Varchar, ColumnType::Double],
            },
        }))
    }

    #[test]
    fn plans_scan_filter_project_limit() {
        let q = planner()
            .plan_query("test", "select customer, amount from orders where amount > 10 limit 5")
            .unwrap();
        assert_eq!(q.col_names, vec!["customer", "amount"]);
        assert_eq!(q.col_types, vec![ColumnType::Varchar, ColumnType::Double]);
        let PhysicalPlan::Limit { limit, input } = q.plan else {
            panic!("expected limit");
        };
        assert_eq!(limit, 5);
        let PhysicalPlan::Project { input, .. } = *input else {
            panic!("expected project");
        };
        assert!(matches!(*input, PhysicalPlan::Filter { .. }));
    }

    #[test]
    fn plans_select_star_as_bare_scan() {
        let q = planner().plan_query("test", "select * from orders").unwrap();
        assert!(matches!(q.plan, PhysicalPlan::TableScan { .. }));
        assert_eq!(q.col_names, vec!["id", "customer", "amount"]);
    }

    #[test]
    fn plans_aggregate_with_group_key_first() {
        let q = planner()
            .plan_query(
                "test",
                "select customer, sum(amount), count(*) from orders group by customer",
            )
            .unwrap();
        assert_eq!(q.group_cols, Some(vec![0]));
        assert_eq!(
            q.col_types,
            vec![ColumnType::Varchar, ColumnType::Double, ColumnType::BigInt]
        );
        let PhysicalPlan::Aggregate { group_by, calls, .. } = q.plan else {
            panic!("expected aggregate");
        };
        assert_eq!(group_by, vec![1]);
        assert_eq!(calls[0].func, AggFunctionType::FirstRow);
        assert_eq!(calls[1].func, AggFunctionType::Sum);
        assert_eq!(calls[2].func, AggFunctionType::Count);
    }

    #[test]
    fn aggregate_after_group_key_required_order() {
        let err = planner()
            .plan_query(
                "test",
                "select sum(amount), customer from orders group by customer",
            )
            .unwrap_err();
        assert!(matches!(err, SluiceError::InvalidStatement(_)));
    }

    #[test]
    fn unknown_table_is_user_visible() {
        let err = planner()
            .plan_query("test", "select * from nope")
            .unwrap_err();
        assert!(matches!(err, SluiceError::TableNotExists { .. }));
    }

    #[test]
    fn parse_create_source_statement() {
        let parsed = parse_statement(
            "create source orders (id bigint, customer varchar, amount double, \
             primary key (id)) with (broker = 'main', topic = 'orders', \
             header_encoding = 'json', key_encoding = 'int64be', value_encoding = 'json')",
        )
        .unwrap();
        let ParsedStatement::Ddl(DdlStatement::CreateSource {
            name,
            column_names,
            column_types,
            primary_key_cols,
            options,
        }) = parsed
        else {
            panic!("expected create source");
        };
        assert_eq!(name, "orders");
        assert_eq!(column_names, vec!["id", "customer", "amount"]);
        assert_eq!(
            column_types,
            vec![ColumnType::BigInt, ColumnType::Varchar, ColumnType::Double]
        );
        assert_eq!(primary_key_cols, vec![0]);
        assert_eq!(options.get("broker").map(String::as_str), Some("main"));
        assert_eq!(options.get("topic").map(String::as_str), Some("orders"));
    }

    #[test]
    fn parse_create_mv_statement() {
        let parsed = parse_statement(
            "create materialized view totals as select customer, sum(amount) from orders group by customer",
        )
        .unwrap();
        let ParsedStatement::Ddl(DdlStatement::CreateMaterializedView { name, query }) = parsed
        else {
            panic!("expected create mv");
        };
        assert_eq!(name, "totals");
        assert!(query.to_lowercase().starts_with("select"));
    }

    #[test]
    fn parse_drop_statements() {
        let ParsedStatement::Ddl(dropped) = parse_statement("drop source orders").unwrap() else {
            panic!("expected ddl");
        };
        assert_eq!(
            dropped,
            DdlStatement::DropSource {
                name: "orders".into()
            }
        );
        let ParsedStatement::Ddl(dropped) =
            parse_statement("drop materialized view totals;").unwrap()
        else {
            panic!("expected ddl");
        };
        assert_eq!(
            dropped,
            DdlStatement::DropMaterializedView {
                name: "totals".into()
            }
        );
    }

    #[test]
    fn select_classified_as_query() {
        let parsed = parse_statement("select * from orders").unwrap();
        assert!(matches!(parsed, ParsedStatement::Query(_)));
    }

    #[test]
    fn expression_eval_semantics() {
        let names = vec!["a".to_string(), "b".to_string()];
        let row = Row::new(vec![Some(Datum::Int(3)), Some(Datum::Double(1.5))]);
        let parsed = parse_one("select 1 from t where a > 2 and b < 2.0").unwrap();
        let Statement::Query(q) = parsed else { panic!() };
        let SetExpr::Select(select) = q.body.as_ref() else {
            panic!()
        };
        let pred = convert_expr(select.selection.as_ref().unwrap(), &names).unwrap();
        assert!(pred.eval_bool(&row).unwrap());

        let null_row = Row::new(vec![None, Some(Datum::Double(1.5))]);
        assert!(!pred.eval_bool(&null_row).unwrap());
    }
}
