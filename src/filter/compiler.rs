use super::{ColumnWhitelist, Condition, FilterExpression, Operator};
use crate::binder::{Param, SqlType};
use crate::error::QueryError;
use sea_query::Value;
use std::cmp::Ordering;

/// Output of [`compile`]: predicate text with `?` placeholders and the parameters for them,
/// in placeholder order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompiledFilter {
    fragment: String,
    params: Vec<Param>,
}

impl CompiledFilter {
    pub fn fragment(&self) -> &str {
        &self.fragment
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn values(&self) -> Vec<Value> {
        self.params.iter().map(|p| p.value().clone()).collect()
    }

    pub fn types(&self) -> Vec<SqlType> {
        self.params.iter().map(Param::sql_type).collect()
    }

    /// Number of placeholders in the fragment.
    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub(crate) fn into_parts(self) -> (String, Vec<Param>) {
        (self.fragment, self.params)
    }
}

/// Compiles `expr` against `whitelist`.
///
/// Each condition is wrapped in parentheses and the connectors are applied in encounter
/// order, with no precedence between `AND` and `OR` beyond that. Values never enter the SQL
/// text. Nothing is returned unless every condition is valid.
///
/// # Errors
///
/// - [`QueryError::InvalidFilter`] when the expression is empty, the connector count is not
///   one less than the condition count, a condition has the wrong number of values, or a
///   value is empty.
/// - [`QueryError::InvalidColumn`] for a column outside the whitelist.
/// - [`QueryError::InvalidArgument`] for a value that does not parse as its declared type.
pub fn compile(expr: &FilterExpression, whitelist: &ColumnWhitelist) -> Result<CompiledFilter, QueryError> {
    let conditions = expr.conditions();
    let operators = expr.operators();

    if conditions.is_empty() {
        return Err(QueryError::InvalidFilter("filter has no conditions".to_string()));
    }
    if operators.len() + 1 != conditions.len() {
        return Err(QueryError::InvalidFilter(format!(
            "{} conditions need {} logical operators, got {}",
            conditions.len(),
            conditions.len() - 1,
            operators.len()
        )));
    }

    let mut fragment = String::new();
    let mut params = Vec::new();
    for (i, condition) in conditions.iter().enumerate() {
        if i > 0 {
            fragment.push(' ');
            fragment.push_str(operators[i - 1].as_sql());
            fragment.push(' ');
        }
        fragment.push('(');
        fragment.push_str(&render_condition(condition, whitelist, &mut params)?);
        fragment.push(')');
    }

    log::debug!("compiled filter: {fragment} ({} parameters)", params.len());
    Ok(CompiledFilter { fragment, params })
}

fn render_condition(
    condition: &Condition,
    whitelist: &ColumnWhitelist,
    params: &mut Vec<Param>,
) -> Result<String, QueryError> {
    let column = condition.column.trim();
    whitelist.check(column)?;

    let arity = condition.operator.arity();
    if !arity.accepts(condition.values.len()) {
        return Err(QueryError::InvalidFilter(format!(
            "{:?} on '{column}' takes {arity}, got {}",
            condition.operator,
            condition.values.len()
        )));
    }
    if let Some(pos) = condition.values.iter().position(|v| v.trim().is_empty()) {
        return Err(QueryError::InvalidFilter(format!(
            "value {} of the condition on '{column}' is empty",
            pos + 1
        )));
    }

    let ty = condition.declared_type;
    let target = match (condition.operator, ty) {
        (Operator::Like, SqlType::String) => column.to_string(),
        (Operator::Like, _) => format!("CAST({column} AS TEXT)"),
        (_, SqlType::Double) => format!("CAST({column} AS NUMERIC(30,2))"),
        _ => column.to_string(),
    };

    let sql = match condition.operator {
        Operator::IsNull => format!("{target} IS NULL"),
        Operator::IsNotNull => format!("{target} IS NOT NULL"),
        Operator::Like => {
            let pattern = condition.values[0].trim().replace('*', "%");
            params.push(Param::from(pattern));
            format!("{target} LIKE ?")
        }
        Operator::In | Operator::NotIn => {
            for raw in &condition.values {
                params.push(Param::new(ty.coerce(raw)?, ty)?);
            }
            let keyword = if condition.operator == Operator::In { "IN" } else { "NOT IN" };
            let placeholders = vec!["?"; condition.values.len()].join(", ");
            format!("{target} {keyword} ({placeholders})")
        }
        Operator::Between => {
            let mut low = ty.coerce(&condition.values[0])?;
            let mut high = ty.coerce(&condition.values[1])?;
            if compare(&low, &high) == Some(Ordering::Greater) {
                std::mem::swap(&mut low, &mut high);
            }
            params.push(Param::new(low, ty)?);
            params.push(Param::new(high, ty)?);
            format!("{target} BETWEEN ? AND ?")
        }
        op => {
            let comparison = op.comparison().unwrap_or("=");
            params.push(Param::new(ty.coerce(&condition.values[0])?, ty)?);
            format!("{target} {comparison} ?")
        }
    };
    Ok(sql)
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Int(Some(a)), Value::Int(Some(b))) => Some(a.cmp(b)),
        (Value::BigInt(Some(a)), Value::BigInt(Some(b))) => Some(a.cmp(b)),
        (Value::Double(Some(a)), Value::Double(Some(b))) => a.partial_cmp(b),
        (Value::String(Some(a)), Value::String(Some(b))) => Some(a.cmp(b)),
        (Value::ChronoDate(Some(a)), Value::ChronoDate(Some(b))) => Some(a.cmp(b)),
        (Value::ChronoDateTime(Some(a)), Value::ChronoDateTime(Some(b))) => Some(a.cmp(b)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::LogicalOperator;
    use chrono::NaiveDate;

    fn whitelist() -> ColumnWhitelist {
        ColumnWhitelist::new([
            "status",
            "country",
            "elevation",
            "acqdate",
            "number",
            "latitude",
            "name",
        ])
    }

    fn eq(column: &str, value: &str) -> Condition {
        Condition::new(column, Operator::Equal, [value], SqlType::String)
    }

    #[test]
    fn test_conditions_wrapped_and_joined_left_to_right() {
        let expr = FilterExpression::new(eq("status", "active"))
            .and(eq("country", "DE"))
            .or(eq("country", "FR"));
        let compiled = compile(&expr, &whitelist()).unwrap();
        assert_eq!(
            compiled.fragment(),
            "(status = ?) AND (country = ?) OR (country = ?)"
        );
        assert_eq!(
            compiled.values(),
            vec![
                Value::from("active".to_string()),
                Value::from("DE".to_string()),
                Value::from("FR".to_string()),
            ]
        );
        assert_eq!(compiled.types(), vec![SqlType::String; 3]);
    }

    #[test]
    fn test_values_never_reach_sql_text() {
        let expr = FilterExpression::new(eq("name", "x' OR '1'='1"));
        let compiled = compile(&expr, &whitelist()).unwrap();
        assert_eq!(compiled.fragment(), "(name = ?)");
        assert!(!compiled.fragment().contains("OR '1'"));
    }

    #[test]
    fn test_arity_mismatch_is_invalid_filter() {
        let cases = [
            Condition::new("elevation", Operator::Between, ["5"], SqlType::Integer),
            Condition::new("elevation", Operator::Equal, ["1", "2"], SqlType::Integer),
            Condition::new("elevation", Operator::In, Vec::<String>::new(), SqlType::Integer),
            Condition::new("elevation", Operator::IsNull, ["1"], SqlType::Integer),
            Condition::new("elevation", Operator::Between, ["1", "2", "3"], SqlType::Integer),
        ];
        for condition in cases {
            let err = compile(&FilterExpression::new(condition.clone()), &whitelist()).unwrap_err();
            assert!(
                matches!(err, QueryError::InvalidFilter(_)),
                "{condition:?} should fail arity, got {err}"
            );
        }
    }

    #[test]
    fn test_operator_count_must_be_conditions_minus_one() {
        let conditions = vec![eq("status", "a"), eq("country", "b"), eq("name", "c")];
        for count in [0, 1, 3] {
            let operators = vec![LogicalOperator::And; count];
            let expr = FilterExpression::from_parts(conditions.clone(), operators);
            assert!(matches!(compile(&expr, &whitelist()), Err(QueryError::InvalidFilter(_))));
        }
        let expr = FilterExpression::from_parts(
            conditions,
            vec![LogicalOperator::Or, LogicalOperator::And],
        );
        let compiled = compile(&expr, &whitelist()).unwrap();
        assert_eq!(compiled.fragment(), "(status = ?) OR (country = ?) AND (name = ?)");

        let empty = FilterExpression::from_parts(Vec::new(), Vec::new());
        assert!(matches!(compile(&empty, &whitelist()), Err(QueryError::InvalidFilter(_))));
    }

    #[test]
    fn test_unknown_column_rejected() {
        let expr = FilterExpression::new(eq("status", "active")).and(eq("nonexistent_col", "x"));
        match compile(&expr, &whitelist()) {
            Err(QueryError::InvalidColumn(column)) => assert_eq!(column, "nonexistent_col"),
            other => panic!("expected InvalidColumn, got {other:?}"),
        }
    }

    #[test]
    fn test_qualified_column_allowed() {
        let expr = FilterExpression::new(eq("germinatebase.name", "ABC"));
        let compiled = compile(&expr, &whitelist()).unwrap();
        assert_eq!(compiled.fragment(), "(germinatebase.name = ?)");
    }

    #[test]
    fn test_in_renders_one_placeholder_per_value() {
        let expr = FilterExpression::new(Condition::new(
            "number",
            Operator::In,
            ["3", "1", "2"],
            SqlType::Long,
        ))
        .and(Condition::new("country", Operator::NotIn, ["DE"], SqlType::String));
        let compiled = compile(&expr, &whitelist()).unwrap();
        assert_eq!(compiled.fragment(), "(number IN (?, ?, ?)) AND (country NOT IN (?))");
        assert_eq!(
            compiled.values()[..3],
            [Value::from(3i64), Value::from(1i64), Value::from(2i64)]
        );
        assert_eq!(compiled.types()[3], SqlType::String);
    }

    #[test]
    fn test_between_normalizes_bounds() {
        let expr = FilterExpression::new(Condition::new(
            "acqdate",
            Operator::Between,
            ["2020-12-31", "2019-01-01"],
            SqlType::Date,
        ));
        let compiled = compile(&expr, &whitelist()).unwrap();
        assert_eq!(compiled.fragment(), "(acqdate BETWEEN ? AND ?)");
        assert_eq!(
            compiled.values(),
            vec![
                Value::from(NaiveDate::from_ymd_opt(2019, 1, 1).unwrap()),
                Value::from(NaiveDate::from_ymd_opt(2020, 12, 31).unwrap()),
            ]
        );

        let numeric = FilterExpression::new(Condition::new(
            "elevation",
            Operator::Between,
            ["900", "100"],
            SqlType::Integer,
        ));
        let compiled = compile(&numeric, &whitelist()).unwrap();
        assert_eq!(compiled.values(), vec![Value::from(100i32), Value::from(900i32)]);
    }

    #[test]
    fn test_double_columns_compare_rounded() {
        let expr = FilterExpression::new(Condition::new(
            "latitude",
            Operator::GreaterThanOrEqual,
            ["52.5"],
            SqlType::Double,
        ));
        let compiled = compile(&expr, &whitelist()).unwrap();
        assert_eq!(compiled.fragment(), "(CAST(latitude AS NUMERIC(30,2)) >= ?)");
        assert_eq!(compiled.values(), vec![Value::from(52.5f64)]);
    }

    #[test]
    fn test_like_translates_wildcard() {
        let expr = FilterExpression::new(Condition::new("name", Operator::Like, ["Hordeum*"], SqlType::String))
            .and(Condition::new("number", Operator::Like, ["12*"], SqlType::Long));
        let compiled = compile(&expr, &whitelist()).unwrap();
        assert_eq!(
            compiled.fragment(),
            "(name LIKE ?) AND (CAST(number AS TEXT) LIKE ?)"
        );
        assert_eq!(
            compiled.values(),
            vec![Value::from("Hordeum%".to_string()), Value::from("12%".to_string())]
        );
        assert_eq!(compiled.types(), vec![SqlType::String, SqlType::String]);
    }

    #[test]
    fn test_null_tests_bind_nothing() {
        let expr = FilterExpression::new(Condition::unary("acqdate", Operator::IsNull, SqlType::Date))
            .or(Condition::unary("elevation", Operator::IsNotNull, SqlType::Integer));
        let compiled = compile(&expr, &whitelist()).unwrap();
        assert_eq!(compiled.fragment(), "(acqdate IS NULL) OR (elevation IS NOT NULL)");
        assert!(compiled.is_empty());
    }

    #[test]
    fn test_empty_value_rejected() {
        let expr = FilterExpression::new(Condition::new("name", Operator::Equal, ["  "], SqlType::String));
        assert!(matches!(compile(&expr, &whitelist()), Err(QueryError::InvalidFilter(_))));
    }

    #[test]
    fn test_value_must_parse_as_declared_type() {
        let expr = FilterExpression::new(Condition::new(
            "acqdate",
            Operator::LessThan,
            ["last tuesday"],
            SqlType::Date,
        ));
        assert!(matches!(compile(&expr, &whitelist()), Err(QueryError::InvalidArgument(_))));

        let expr = FilterExpression::new(Condition::new("elevation", Operator::Equal, ["12m"], SqlType::Integer));
        assert!(matches!(compile(&expr, &whitelist()), Err(QueryError::InvalidArgument(_))));
    }
}
