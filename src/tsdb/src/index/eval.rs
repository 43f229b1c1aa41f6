use std::collections::BTreeMap;
use std::sync::Arc;

use common_base::influxql::{BinaryOp, DataType, Expr};
use common_base::iterator::TryIterator;
use common_base::point::{is_system_tag_key, MEASUREMENT_TAG};
use regex::Regex;

use crate::errors::IndexError;
use crate::index::{
    difference_series_id_iterators, intersect_series_id_iterators, merge_series_id_iterators,
    series_id_expr_iterator, union_series_id_iterators, BoxSeriesIdIterator, Index,
    SeriesIdSliceIterator,
};
use crate::series::series_file::SeriesFile;

/// is_tag_ref reports whether a variable reference resolves against the
/// index rather than field data.
fn is_tag_ref(val: &str, data_type: DataType) -> bool {
    val == MEASUREMENT_TAG || matches!(data_type, DataType::Tag)
}

/// validate_tag_predicate rejects predicates the evaluator cannot resolve
/// before any evaluation begins: comparison operators other than
/// =, !=, =~, !~, AND, OR applied to tags, and system tag keys other than
/// `_name`.
pub fn validate_tag_predicate(expr: &Expr) -> anyhow::Result<()> {
    match expr {
        Expr::Binary { op, lhs, rhs } => match op {
            BinaryOp::And | BinaryOp::Or => {
                validate_tag_predicate(lhs)?;
                validate_tag_predicate(rhs)
            }
            BinaryOp::Eq | BinaryOp::Neq | BinaryOp::EqRegex | BinaryOp::NeqRegex => {
                for side in [lhs.as_ref(), rhs.as_ref()] {
                    if let Expr::VarRef { val, data_type } = side {
                        if is_tag_ref(val, *data_type)
                            && is_system_tag_key(val.as_bytes())
                            && val != MEASUREMENT_TAG
                        {
                            return Err(IndexError::InvalidPredicate(format!(
                                "system tag key {} is not queryable",
                                val
                            ))
                            .into());
                        }
                    }
                }
                Ok(())
            }
            other => {
                // Ordering comparisons only make sense over field values;
                // they travel as residual filters.
                let references_field = [lhs.as_ref(), rhs.as_ref()].iter().any(|side| {
                    matches!(side, Expr::VarRef { val, data_type } if !is_tag_ref(val, *data_type))
                });
                let nested = [lhs.as_ref(), rhs.as_ref()]
                    .iter()
                    .any(|side| matches!(side, Expr::Binary { .. } | Expr::Paren(_)));
                if references_field || nested {
                    Ok(())
                } else {
                    Err(IndexError::InvalidPredicate(format!(
                        "invalid tag comparison operator: {}",
                        other
                    ))
                    .into())
                }
            }
        },
        Expr::Paren(inner) => validate_tag_predicate(inner),
        _ => Ok(()),
    }
}

/// measurement_series_by_expr_iterator returns the series of a measurement
/// filtered by an optional tag predicate. Unresolvable sub-predicates ride
/// along as residual expressions.
pub fn measurement_series_by_expr_iterator(
    index: &dyn Index,
    name: &[u8],
    expr: Option<&Expr>,
) -> anyhow::Result<BoxSeriesIdIterator> {
    match expr {
        None => index.measurement_series_id_iterator(name),
        Some(expr) => {
            validate_tag_predicate(expr)?;
            series_by_expr_iterator(index, name, expr)
        }
    }
}

fn series_by_expr_iterator(
    index: &dyn Index,
    name: &[u8],
    expr: &Expr,
) -> anyhow::Result<BoxSeriesIdIterator> {
    match expr {
        Expr::Binary { op, lhs, rhs } => match op {
            BinaryOp::And => Ok(intersect_series_id_iterators(
                series_by_expr_iterator(index, name, lhs)?,
                series_by_expr_iterator(index, name, rhs)?,
            )),
            BinaryOp::Or => Ok(union_series_id_iterators(
                series_by_expr_iterator(index, name, lhs)?,
                series_by_expr_iterator(index, name, rhs)?,
            )),
            _ => series_by_binary_expr_iterator(index, name, *op, lhs, rhs, expr),
        },
        Expr::Paren(inner) => series_by_expr_iterator(index, name, inner),
        _ => Ok(Box::new(SeriesIdSliceIterator::empty())),
    }
}

fn series_by_binary_expr_iterator(
    index: &dyn Index,
    name: &[u8],
    op: BinaryOp,
    lhs: &Expr,
    rhs: &Expr,
    whole: &Expr,
) -> anyhow::Result<BoxSeriesIdIterator> {
    // Expression math on either side is passed through for downstream
    // evaluation against field data.
    if matches!(lhs, Expr::Binary { .. }) || matches!(rhs, Expr::Binary { .. }) {
        return Ok(series_id_expr_iterator(
            index.measurement_series_id_iterator(name)?,
            Arc::new(whole.clone()),
        ));
    }

    // Find the variable reference; the other side is the comparison value.
    let (key_ref, value) = match (lhs, rhs) {
        (Expr::VarRef { val, data_type }, other) => ((val.as_str(), *data_type), other),
        (other, Expr::VarRef { val, data_type }) => ((val.as_str(), *data_type), other),
        _ => {
            return Err(IndexError::InvalidPredicate(format!(
                "neither side of '{}' is a tag key",
                whole
            ))
            .into())
        }
    };

    // Field comparisons are not resolvable by the index: return every
    // series with the whole expression as a residual filter.
    if !is_tag_ref(key_ref.0, key_ref.1) {
        return Ok(series_id_expr_iterator(
            index.measurement_series_id_iterator(name)?,
            Arc::new(whole.clone()),
        ));
    }

    let key = key_ref.0.as_bytes();
    match value {
        Expr::StringLiteral(s) => {
            series_by_string_iterator(index, name, key, s.as_bytes(), op)
        }
        Expr::RegexLiteral(re) => series_by_regex_iterator(index, name, key, re, op),
        Expr::VarRef { val, data_type } => {
            if is_tag_ref(val, *data_type) {
                // Tag-to-tag comparison resolves via key coverage.
                let lhs_itr = index.tag_key_series_id_iterator(name, key)?;
                let rhs_itr = index.tag_key_series_id_iterator(name, val.as_bytes())?;
                if op == BinaryOp::Eq {
                    Ok(intersect_series_id_iterators(lhs_itr, rhs_itr))
                } else {
                    Ok(difference_series_id_iterators(lhs_itr, rhs_itr))
                }
            } else {
                Ok(series_id_expr_iterator(
                    index.measurement_series_id_iterator(name)?,
                    Arc::new(whole.clone()),
                ))
            }
        }
        _ => {
            if op == BinaryOp::Neq || op == BinaryOp::NeqRegex {
                index.measurement_series_id_iterator(name)
            } else {
                Ok(Box::new(SeriesIdSliceIterator::empty()))
            }
        }
    }
}

fn series_by_string_iterator(
    index: &dyn Index,
    name: &[u8],
    key: &[u8],
    value: &[u8],
    op: BinaryOp,
) -> anyhow::Result<BoxSeriesIdIterator> {
    // Special handling for "_name" to match the measurement name.
    if key == MEASUREMENT_TAG.as_bytes() {
        let matched = value == name;
        if (op == BinaryOp::Eq && matched) || (op == BinaryOp::Neq && !matched) {
            return index.measurement_series_id_iterator(name);
        }
        return Ok(Box::new(SeriesIdSliceIterator::empty()));
    }

    if op == BinaryOp::Eq {
        if !value.is_empty() {
            return index.tag_value_series_id_iterator(name, key, value);
        }
        // key = '' matches series missing the key entirely.
        return Ok(difference_series_id_iterators(
            index.measurement_series_id_iterator(name)?,
            index.tag_key_series_id_iterator(name, key)?,
        ));
    }

    // op == Neq
    if !value.is_empty() {
        return Ok(difference_series_id_iterators(
            index.measurement_series_id_iterator(name)?,
            index.tag_value_series_id_iterator(name, key, value)?,
        ));
    }
    index.tag_key_series_id_iterator(name, key)
}

fn series_by_regex_iterator(
    index: &dyn Index,
    name: &[u8],
    key: &[u8],
    re: &Regex,
    op: BinaryOp,
) -> anyhow::Result<BoxSeriesIdIterator> {
    // Special handling for "_name" to match the measurement name.
    if key == MEASUREMENT_TAG.as_bytes() {
        let matched = re.is_match(&String::from_utf8_lossy(name));
        if (op == BinaryOp::EqRegex && matched) || (op == BinaryOp::NeqRegex && !matched) {
            return index.measurement_series_id_iterator(name);
        }
        return Ok(Box::new(SeriesIdSliceIterator::empty()));
    }

    let matches = op == BinaryOp::EqRegex;

    // A regex that matches the empty string also matches series that are
    // missing the key, so those flip between inclusion and exclusion.
    let empty = re.is_match("");

    let values = index.tag_values(name, key)?;
    let mut matching: Vec<BoxSeriesIdIterator> = Vec::new();
    let mut non_matching: Vec<BoxSeriesIdIterator> = Vec::new();
    for value in &values {
        let value_str = String::from_utf8_lossy(value);
        let itr = index.tag_value_series_id_iterator(name, key, value)?;
        if re.is_match(&value_str) {
            matching.push(itr);
        } else {
            non_matching.push(itr);
        }
    }

    let itr = match (matches, empty) {
        // key =~ re, re can't match "": union of matching postings.
        (true, false) => merge_series_id_iterators(matching),
        // key =~ re, re matches "": everything except non-matching values.
        (true, true) => difference_series_id_iterators(
            index.measurement_series_id_iterator(name)?,
            merge_series_id_iterators(non_matching),
        ),
        // key !~ re, re can't match "": everything except matching values.
        (false, false) => difference_series_id_iterators(
            index.measurement_series_id_iterator(name)?,
            merge_series_id_iterators(matching),
        ),
        // key !~ re, re matches "": only values that fail the regex.
        (false, true) => merge_series_id_iterators(non_matching),
    };
    Ok(itr)
}

/// measurements_by_expr returns the sorted measurement names matching a
/// tag predicate, plus a flag reporting whether the expression was fully
/// resolvable against the index.
pub fn measurements_by_expr(
    index: &dyn Index,
    expr: &Expr,
) -> anyhow::Result<(Vec<Vec<u8>>, bool)> {
    match expr {
        Expr::Binary { op, lhs, rhs } => match op {
            BinaryOp::Eq | BinaryOp::Neq | BinaryOp::EqRegex | BinaryOp::NeqRegex => {
                let tag = match lhs.as_ref() {
                    Expr::VarRef { val, .. } => val.as_str(),
                    _ => {
                        return Err(IndexError::InvalidPredicate(format!(
                            "left side of '{}' must be a tag key",
                            op
                        ))
                        .into())
                    }
                };

                let mut value: &str = "";
                let mut regex: Option<&Regex> = None;
                if op.is_regex_op() {
                    match rhs.as_ref() {
                        Expr::RegexLiteral(re) => regex = Some(re),
                        _ => {
                            return Err(IndexError::InvalidPredicate(format!(
                                "right side of '{}' must be a regular expression",
                                op
                            ))
                            .into())
                        }
                    }
                } else {
                    match rhs.as_ref() {
                        Expr::StringLiteral(s) => value = s.as_str(),
                        _ => {
                            return Err(IndexError::InvalidPredicate(format!(
                                "right side of '{}' must be a tag value string",
                                op
                            ))
                            .into())
                        }
                    }
                }

                if tag == MEASUREMENT_TAG {
                    return Ok((
                        measurements_by_name_filter(index, *op, value, regex)?,
                        true,
                    ));
                } else if is_system_tag_key(tag.as_bytes()) {
                    return Ok((Vec::new(), false));
                }
                Ok((
                    measurements_by_tag_filter(index, *op, tag, value, regex)?,
                    true,
                ))
            }
            BinaryOp::And | BinaryOp::Or => {
                let (lhs_names, lhs_ok) = measurements_by_expr(index, lhs)?;
                let (rhs_names, rhs_ok) = measurements_by_expr(index, rhs)?;

                if lhs_ok && rhs_ok {
                    let names = if *op == BinaryOp::Or {
                        union_names(lhs_names, rhs_names)
                    } else {
                        intersect_names(lhs_names, rhs_names)
                    };
                    Ok((names, true))
                } else if lhs_ok {
                    Ok((lhs_names, true))
                } else if rhs_ok {
                    Ok((rhs_names, true))
                } else {
                    Ok((Vec::new(), false))
                }
            }
            other => Err(IndexError::InvalidPredicate(format!(
                "invalid tag comparison operator: {}",
                other
            ))
            .into()),
        },
        Expr::Paren(inner) => measurements_by_expr(index, inner),
        other => Err(
            IndexError::InvalidPredicate(format!("invalid measurement predicate: {}", other))
                .into(),
        ),
    }
}

fn measurements_by_name_filter(
    index: &dyn Index,
    op: BinaryOp,
    value: &str,
    regex: Option<&Regex>,
) -> anyhow::Result<Vec<Vec<u8>>> {
    let mut names = Vec::new();
    for name in index.measurement_names()? {
        let name_str = String::from_utf8_lossy(&name).to_string();
        let matched = match op {
            BinaryOp::Eq => name_str == value,
            BinaryOp::Neq => name_str != value,
            BinaryOp::EqRegex => regex.map(|re| re.is_match(&name_str)).unwrap_or(false),
            BinaryOp::NeqRegex => regex.map(|re| !re.is_match(&name_str)).unwrap_or(false),
            _ => false,
        };
        if matched {
            names.push(name);
        }
    }
    Ok(names)
}

fn measurements_by_tag_filter(
    index: &dyn Index,
    op: BinaryOp,
    key: &str,
    value: &str,
    regex: Option<&Regex>,
) -> anyhow::Result<Vec<Vec<u8>>> {
    let mut names = Vec::new();
    for name in index.measurement_names()? {
        let tag_match = if op == BinaryOp::Eq || op == BinaryOp::Neq {
            index.has_tag_value(&name, key.as_bytes(), value.as_bytes())?
        } else {
            let mut any = false;
            for tag_value in index.tag_values(&name, key.as_bytes())? {
                if regex
                    .map(|re| re.is_match(&String::from_utf8_lossy(&tag_value)))
                    .unwrap_or(false)
                {
                    any = true;
                    break;
                }
            }
            any
        };

        // XNOR: a positive operator keeps matching measurements; a negative
        // operator keeps the rest.
        if tag_match == (op == BinaryOp::Eq || op == BinaryOp::EqRegex) {
            names.push(name);
        }
    }
    Ok(names)
}

fn union_names(lhs: Vec<Vec<u8>>, rhs: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
    let mut out = lhs;
    out.extend(rhs);
    out.sort();
    out.dedup();
    out
}

fn intersect_names(lhs: Vec<Vec<u8>>, rhs: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
    let rhs_set: std::collections::BTreeSet<Vec<u8>> = rhs.into_iter().collect();
    lhs.into_iter().filter(|n| rhs_set.contains(n)).collect()
}

/// TagSet is a group-by composite: the series that share one combination of
/// dimension values, each with its residual filter.
#[derive(Clone, Debug, Default)]
pub struct TagSet {
    pub key: Vec<u8>,
    pub tags: BTreeMap<String, String>,
    pub series_keys: Vec<Vec<u8>>,
    pub filters: Vec<Option<Arc<Expr>>>,
}

impl TagSet {
    fn add_filter(&mut self, series_key: Vec<u8>, filter: Option<Arc<Expr>>) {
        self.series_keys.push(series_key);
        self.filters.push(filter);
    }

    fn sort_series(&mut self) {
        let mut pairs: Vec<(Vec<u8>, Option<Arc<Expr>>)> = self
            .series_keys
            .drain(..)
            .zip(self.filters.drain(..))
            .collect();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        for (key, filter) in pairs {
            self.series_keys.push(key);
            self.filters.push(filter);
        }
    }
}

/// marshal_tags encodes a dimension map into a deterministic composite key.
fn marshal_tags(tags: &BTreeMap<String, String>) -> Vec<u8> {
    if tags.is_empty() {
        return Vec::new();
    }

    let mut sz = (tags.len() * 2) - 1;
    for (k, v) in tags {
        sz += k.len() + v.len();
    }

    let mut buf = Vec::with_capacity(sz);
    for (i, k) in tags.keys().enumerate() {
        if i > 0 {
            buf.push(b'|');
        }
        buf.extend_from_slice(k.as_bytes());
    }
    for v in tags.values() {
        buf.push(b'|');
        buf.extend_from_slice(v.as_bytes());
    }
    buf.truncate(sz);
    buf
}

/// tag_sets groups a measurement's series by the requested dimensions,
/// filtered by an optional condition. Series in the same group form one
/// composite series for GROUP BY purposes.
pub fn tag_sets(
    index: &dyn Index,
    sfile: &SeriesFile,
    name: &[u8],
    dimensions: &[String],
    condition: Option<&Expr>,
    max_select_series: u64,
) -> anyhow::Result<Vec<TagSet>> {
    let mut itr = measurement_series_by_expr_iterator(index, name, condition)?;

    let mut tag_sets: BTreeMap<Vec<u8>, TagSet> = BTreeMap::new();
    let mut n = 0_u64;

    while let Some(elem) = itr.try_next()? {
        n += 1;
        if max_select_series > 0 && n > max_select_series {
            return Err(IndexError::MaxSelectSeriesExceeded {
                n,
                max: max_select_series,
            }
            .into());
        }

        let (series_key, series_tags) = match sfile.series(elem.series_id) {
            Some((_, tags)) => (
                sfile
                    .series_key(elem.series_id)
                    .map(|k| k.to_vec())
                    .unwrap_or_default(),
                tags,
            ),
            None => continue,
        };

        let mut tags = BTreeMap::new();
        for dim in dimensions {
            let value = series_tags
                .get(dim.as_bytes())
                .map(|v| String::from_utf8_lossy(v).to_string())
                .unwrap_or_default();
            tags.insert(dim.clone(), value);
        }

        let key = marshal_tags(&tags);
        let set = tag_sets.entry(key.clone()).or_insert_with(|| TagSet {
            key,
            tags: tags.clone(),
            ..TagSet::default()
        });

        // Boolean-literal-true filters carry no information; drop them.
        let filter = elem.expr.filter(|e| !e.is_true_literal());
        set.add_filter(series_key, filter);
    }

    let mut out: Vec<TagSet> = tag_sets.into_values().collect();
    for set in &mut out {
        set.sort_series();
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common_base::influxql::Expr;

    #[test]
    fn test_validate_rejects_ordering_on_tags() {
        let expr = Expr::binary(
            BinaryOp::Gt,
            Expr::tag_ref("host"),
            Expr::StringLiteral("a".to_string()),
        );
        assert!(validate_tag_predicate(&expr).is_err());
    }

    #[test]
    fn test_validate_allows_ordering_on_fields() {
        let expr = Expr::binary(
            BinaryOp::Gt,
            Expr::field_ref("value"),
            Expr::NumberLiteral(3.0),
        );
        assert!(validate_tag_predicate(&expr).is_ok());
    }

    #[test]
    fn test_validate_rejects_system_tags() {
        let expr = Expr::binary(
            BinaryOp::Eq,
            Expr::tag_ref("_field"),
            Expr::StringLiteral("x".to_string()),
        );
        assert!(validate_tag_predicate(&expr).is_err());

        let name_expr = Expr::binary(
            BinaryOp::Eq,
            Expr::tag_ref("_name"),
            Expr::StringLiteral("cpu".to_string()),
        );
        assert!(validate_tag_predicate(&name_expr).is_ok());
    }

    #[test]
    fn test_marshal_tags_is_deterministic() {
        let mut tags = BTreeMap::new();
        tags.insert("host".to_string(), "a".to_string());
        tags.insert("region".to_string(), "us".to_string());
        assert_eq!(marshal_tags(&tags), b"host|region|a|us".to_vec());
        assert!(marshal_tags(&BTreeMap::new()).is_empty());
    }
}
