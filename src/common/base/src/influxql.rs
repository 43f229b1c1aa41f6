use std::fmt::{Display, Formatter};

use regex::Regex;

/// MIN_TIME is the minumum time that can be represented.
///
/// 1677-09-21 00:12:43.145224194 +0000 UTC
///
/// The two lowest minimum integers are used as sentinel values.  The
/// minimum value needs to be used as a value lower than any other value for
/// comparisons and another separate value is needed to act as a sentinel
/// default value that is unusable by the user, but usable internally.
/// Because these two values need to be used for a special purpose, we do
/// not allow users to write points at these two times.
pub const MIN_TIME: i64 = i64::MIN + 2;

/// MAX_TIME is the maximum time that can be represented.
///
/// 2262-04-11 23:47:16.854775806 +0000 UTC
///
/// The highest time represented by a nanosecond needs to be used for an
/// exclusive range in the shard group, so the maximum time needs to be one
/// less than the possible maximum number of nanoseconds representable by an
/// int64 so that we don't lose a point at that one time.
pub const MAX_TIME: i64 = i64::MAX - 1;

/// DataType represents the primitive data types available in the query layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataType {
    /// Unknown primitive data type.
    Unknown,
    /// Float means the data type is a float.
    Float,
    /// Integer means the data type is an integer.
    Integer,
    /// String means the data type is a string of text.
    String,
    /// Boolean means the data type is a boolean.
    Boolean,
    /// Tag means the data type is a tag.
    Tag,
    /// AnyField means the data type is any field.
    AnyField,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Unknown => "unknown",
            DataType::Float => "float",
            DataType::Integer => "integer",
            DataType::String => "string",
            DataType::Boolean => "boolean",
            DataType::Tag => "tag",
            DataType::AnyField => "field",
        }
    }
}

impl<'a> From<&'a str> for DataType {
    fn from(value: &'a str) -> Self {
        match value {
            "float" => DataType::Float,
            "integer" => DataType::Integer,
            "string" => DataType::String,
            "boolean" => DataType::Boolean,
            "tag" => DataType::Tag,
            "field" => DataType::AnyField,
            _ => DataType::Unknown,
        }
    }
}

impl Display for DataType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// BinaryOp is an operator in a tag predicate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    Neq,
    EqRegex,
    NeqRegex,
    And,
    Or,
    Lt,
    Lte,
    Gt,
    Gte,
}

impl BinaryOp {
    /// is_regex_op returns true for the regular expression comparison operators.
    pub fn is_regex_op(&self) -> bool {
        matches!(self, BinaryOp::EqRegex | BinaryOp::NeqRegex)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BinaryOp::Eq => "=",
            BinaryOp::Neq => "!=",
            BinaryOp::EqRegex => "=~",
            BinaryOp::NeqRegex => "!~",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
            BinaryOp::Lt => "<",
            BinaryOp::Lte => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Gte => ">=",
        }
    }
}

impl Display for BinaryOp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Expr is a tag-expression AST. The storage engine consumes these; it never
/// produces them from text.
#[derive(Clone, Debug)]
pub enum Expr {
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Paren(Box<Expr>),
    VarRef {
        val: String,
        data_type: DataType,
    },
    StringLiteral(String),
    RegexLiteral(Regex),
    BooleanLiteral(bool),
    IntegerLiteral(i64),
    NumberLiteral(f64),
}

impl Expr {
    /// binary builds a binary expression node.
    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    /// tag_ref builds a reference to a tag key.
    pub fn tag_ref(name: &str) -> Expr {
        Expr::VarRef {
            val: name.to_string(),
            data_type: DataType::Tag,
        }
    }

    /// field_ref builds a reference to a field of unknown type.
    pub fn field_ref(name: &str) -> Expr {
        Expr::VarRef {
            val: name.to_string(),
            data_type: DataType::AnyField,
        }
    }

    /// is_true_literal reports whether the expression is the literal `true`.
    pub fn is_true_literal(&self) -> bool {
        matches!(self, Expr::BooleanLiteral(true))
    }
}

impl PartialEq for Expr {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Expr::Binary { op, lhs, rhs },
                Expr::Binary {
                    op: op2,
                    lhs: lhs2,
                    rhs: rhs2,
                },
            ) => op == op2 && lhs == lhs2 && rhs == rhs2,
            (Expr::Paren(a), Expr::Paren(b)) => a == b,
            (
                Expr::VarRef { val, data_type },
                Expr::VarRef {
                    val: val2,
                    data_type: data_type2,
                },
            ) => val == val2 && data_type == data_type2,
            (Expr::StringLiteral(a), Expr::StringLiteral(b)) => a == b,
            (Expr::RegexLiteral(a), Expr::RegexLiteral(b)) => a.as_str() == b.as_str(),
            (Expr::BooleanLiteral(a), Expr::BooleanLiteral(b)) => a == b,
            (Expr::IntegerLiteral(a), Expr::IntegerLiteral(b)) => a == b,
            (Expr::NumberLiteral(a), Expr::NumberLiteral(b)) => a == b,
            _ => false,
        }
    }
}

impl Display for Expr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Expr::Binary { op, lhs, rhs } => write!(f, "{} {} {}", lhs, op, rhs),
            Expr::Paren(inner) => write!(f, "({})", inner),
            Expr::VarRef { val, .. } => write!(f, "{}", val),
            Expr::StringLiteral(s) => write!(f, "'{}'", s),
            Expr::RegexLiteral(re) => write!(f, "/{}/", re.as_str()),
            Expr::BooleanLiteral(b) => write!(f, "{}", b),
            Expr::IntegerLiteral(v) => write!(f, "{}", v),
            Expr::NumberLiteral(v) => write!(f, "{}", v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expr_display() {
        let expr = Expr::binary(
            BinaryOp::And,
            Expr::binary(
                BinaryOp::Eq,
                Expr::tag_ref("host"),
                Expr::StringLiteral("a".to_string()),
            ),
            Expr::Paren(Box::new(Expr::binary(
                BinaryOp::EqRegex,
                Expr::tag_ref("region"),
                Expr::RegexLiteral(Regex::new("us-.*").unwrap()),
            ))),
        );
        assert_eq!(expr.to_string(), "host = 'a' AND (region =~ /us-.*/)");
    }

    #[test]
    fn test_expr_eq_compares_regex_source() {
        let a = Expr::RegexLiteral(Regex::new("x+").unwrap());
        let b = Expr::RegexLiteral(Regex::new("x+").unwrap());
        assert_eq!(a, b);
    }
}
