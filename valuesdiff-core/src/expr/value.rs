use std::{borrow::Cow, cmp::Ordering, collections::BTreeMap, fmt, rc::Rc};

use super::{parser::ArrowFn, FaultKind, RuntimeError};

/// A value inside the sandbox. Follows JavaScript's value semantics for the
/// subset of types an expression can observe.
#[derive(Clone)]
pub(crate) enum Value {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Str(Rc<str>),
    Array(Rc<Vec<Value>>),
    Object(Rc<BTreeMap<String, Value>>),
    Function(Rc<Function>),
}

pub(crate) enum Function {
    Arrow { def: Rc<ArrowFn>, scope: Scope },
    /// A builtin method together with the value it was read from.
    Method { receiver: Value, method: Method },
    /// The global `Object` namespace.
    ObjectNamespace,
    ObjectStatic(ObjectStatic),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ObjectStatic {
    Keys,
    Values,
    Entries,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Method {
    // Arrays
    Includes,
    IndexOf,
    Join,
    Some,
    Every,
    Filter,
    Map,
    Find,
    Concat,
    Slice,
    // Strings
    StrIncludes,
    StartsWith,
    EndsWith,
    StrIndexOf,
    ToUpperCase,
    ToLowerCase,
    Trim,
    StrSlice,
    // Objects
    HasOwnProperty,
}

impl Method {
    pub fn for_array(name: &str) -> Option<Method> {
        Some(match name {
            "includes" => Method::Includes,
            "indexOf" => Method::IndexOf,
            "join" => Method::Join,
            "some" => Method::Some,
            "every" => Method::Every,
            "filter" => Method::Filter,
            "map" => Method::Map,
            "find" => Method::Find,
            "concat" => Method::Concat,
            "slice" => Method::Slice,
            _ => return None,
        })
    }

    pub fn for_string(name: &str) -> Option<Method> {
        Some(match name {
            "includes" => Method::StrIncludes,
            "startsWith" => Method::StartsWith,
            "endsWith" => Method::EndsWith,
            "indexOf" => Method::StrIndexOf,
            "toUpperCase" => Method::ToUpperCase,
            "toLowerCase" => Method::ToLowerCase,
            "trim" => Method::Trim,
            "slice" => Method::StrSlice,
            _ => return None,
        })
    }

    pub fn for_object(name: &str) -> Option<Method> {
        match name {
            "hasOwnProperty" => Some(Method::HasOwnProperty),
            _ => None,
        }
    }
}

/// Parameter bindings of the enclosing arrow functions, innermost first.
#[derive(Clone, Default)]
pub(crate) struct Scope(Option<Rc<Frame>>);

struct Frame {
    bindings: Vec<(String, Value)>,
    parent: Scope,
}

impl Scope {
    pub fn with(&self, bindings: Vec<(String, Value)>) -> Scope {
        Scope(Some(Rc::new(Frame {
            bindings,
            parent: self.clone(),
        })))
    }

    pub fn lookup(&self, name: &str) -> Option<Value> {
        let mut current = self.0.as_ref();
        while let Some(frame) = current {
            if let Some((_, v)) = frame.bindings.iter().find(|(n, _)| n == name) {
                return Some(v.clone());
            }
            current = frame.parent.0.as_ref();
        }
        None
    }
}

impl Value {
    pub fn str(s: &str) -> Value {
        Value::Str(Rc::from(s))
    }

    pub fn string(s: String) -> Value {
        Value::Str(Rc::from(s))
    }

    pub fn array(items: Vec<Value>) -> Value {
        Value::Array(Rc::new(items))
    }

    pub fn type_of(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null | Value::Array(_) | Value::Object(_) => "object",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::Function(_) => "function",
        }
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => !(*n == 0.0 || n.is_nan()),
            Value::Str(s) => !s.is_empty(),
            Value::Array(_) | Value::Object(_) | Value::Function(_) => true,
        }
    }

    /// Primitive conversion with the string hint, which is what every
    /// operator here ends up using for arrays and objects.
    pub fn to_primitive(&self, max_len: usize) -> Result<Value, RuntimeError> {
        match self {
            Value::Array(_) | Value::Object(_) | Value::Function(_) => {
                Ok(Value::string(self.to_js_string(max_len)?))
            }
            other => Ok(other.clone()),
        }
    }

    /// `Number(value)`. Arrays are converted without building their string
    /// form: any array with two or more elements contains a comma.
    pub fn to_number(&self) -> f64 {
        match self {
            Value::Undefined => f64::NAN,
            Value::Null => 0.0,
            Value::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            Value::Number(n) => *n,
            Value::Str(s) => string_to_number(s),
            Value::Array(items) => match items.as_slice() {
                [] => 0.0,
                [item] if item.is_nullish() => 0.0,
                [item @ (Value::Array(_) | Value::Str(_) | Value::Number(_))] => item.to_number(),
                _ => f64::NAN,
            },
            Value::Object(_) | Value::Function(_) => f64::NAN,
        }
    }

    /// `String(value)`, failing once the result would exceed `max_len` bytes.
    pub fn to_js_string(&self, max_len: usize) -> Result<String, RuntimeError> {
        let mut out = String::new();
        self.write_js_string(&mut out, max_len)?;
        Ok(out)
    }

    /// Append `String(value)` to `out`. Arrays are written element by element
    /// and the length is checked before every piece, so a conversion never
    /// allocates much more than `max_len`.
    pub fn write_js_string(&self, out: &mut String, max_len: usize) -> Result<(), RuntimeError> {
        let piece: Cow<'_, str> = match self {
            Value::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        push_bounded(out, ",", max_len)?;
                    }
                    if !item.is_nullish() {
                        item.write_js_string(out, max_len)?;
                    }
                }
                return Ok(());
            }
            Value::Undefined => "undefined".into(),
            Value::Null => "null".into(),
            Value::Bool(true) => "true".into(),
            Value::Bool(false) => "false".into(),
            Value::Number(n) => number_to_string(*n).into(),
            Value::Str(s) => Cow::Borrowed(&**s),
            Value::Object(_) => "[object Object]".into(),
            Value::Function(_) => "function () { [native code] }".into(),
        };
        push_bounded(out, &piece, max_len)
    }

    /// A short rendering for error messages.
    pub fn describe(&self) -> String {
        match self {
            Value::Undefined => "undefined".to_string(),
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => number_to_string(*n),
            Value::Str(s) => s.to_string(),
            Value::Array(_) => "[object Array]".to_string(),
            Value::Object(_) => "[object Object]".to_string(),
            Value::Function(_) => "function".to_string(),
        }
    }

    pub fn strict_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// `SameValueZero`, used by `includes`: like `===` but `NaN` equals itself.
    pub fn same_value_zero(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) if a.is_nan() && b.is_nan() => true,
            _ => self.strict_equals(other),
        }
    }

    pub fn loose_equals(&self, other: &Value, max_len: usize) -> Result<bool, RuntimeError> {
        Ok(match (self, other) {
            (a, b) if a.is_nullish() && b.is_nullish() => true,
            (a, b) if a.is_nullish() || b.is_nullish() => false,
            (Value::Number(a), Value::Str(_)) => *a == other.to_number(),
            (Value::Str(_), Value::Number(b)) => self.to_number() == *b,
            (Value::Bool(_), _) => {
                return Value::Number(self.to_number()).loose_equals(other, max_len)
            }
            (_, Value::Bool(_)) => {
                return self.loose_equals(&Value::Number(other.to_number()), max_len)
            }
            (a, Value::Number(n)) if a.is_reference() => a.to_number() == *n,
            (Value::Number(n), b) if b.is_reference() => *n == b.to_number(),
            (a, b) if a.is_reference() && !b.is_reference() => {
                return a.to_primitive(max_len)?.loose_equals(b, max_len)
            }
            (a, b) if !a.is_reference() && b.is_reference() => {
                return a.loose_equals(&b.to_primitive(max_len)?, max_len)
            }
            _ => self.strict_equals(other),
        })
    }

    fn is_reference(&self) -> bool {
        matches!(
            self,
            Value::Array(_) | Value::Object(_) | Value::Function(_)
        )
    }

    /// Abstract relational comparison. `None` means the operands are
    /// unordered (a `NaN` was involved), which makes every relational operator
    /// false.
    ///
    /// Strings compare as strings only when both sides turn into one;
    /// otherwise both are compared as numbers.
    pub fn compare(&self, other: &Value, max_len: usize) -> Result<Option<Ordering>, RuntimeError> {
        let stringish = |v: &Value| matches!(v, Value::Str(_)) || v.is_reference();
        if stringish(self) && stringish(other) {
            if let (Value::Str(x), Value::Str(y)) =
                (self.to_primitive(max_len)?, other.to_primitive(max_len)?)
            {
                return Ok(Some(x.encode_utf16().cmp(y.encode_utf16())));
            }
        }
        Ok(self.to_number().partial_cmp(&other.to_number()))
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => write!(f, "{:?}", s),
            Value::Array(items) => f.debug_list().entries(items.iter()).finish(),
            Value::Object(map) => f.debug_map().entries(map.iter()).finish(),
            other => f.write_str(&other.describe()),
        }
    }
}

fn push_bounded(out: &mut String, piece: &str, max_len: usize) -> Result<(), RuntimeError> {
    let len = out.len() + piece.len();
    if len > max_len {
        return Err(string_too_long(len, max_len));
    }
    out.push_str(piece);
    Ok(())
}

pub(crate) fn string_too_long(len: usize, max_len: usize) -> RuntimeError {
    RuntimeError {
        kind: FaultKind::RangeError,
        message: format!(
            "Invalid string length: {} bytes exceeds the limit of {}",
            len, max_len
        ),
    }
}

/// JavaScript's `Number(string)`.
pub(crate) fn string_to_number(s: &str) -> f64 {
    let t = s.trim();
    if t.is_empty() {
        return 0.0;
    }
    match t {
        "Infinity" | "+Infinity" => return f64::INFINITY,
        "-Infinity" => return f64::NEG_INFINITY,
        _ => {}
    }
    if let Some(hex) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        return hex_to_number(hex).unwrap_or(f64::NAN);
    }
    // Rust accepts spellings such as "inf" and "nan" that JavaScript does not.
    if !t
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-'))
    {
        return f64::NAN;
    }
    t.parse::<f64>().unwrap_or(f64::NAN)
}

/// The value of a string of hexadecimal digits. Long literals lose
/// precision the way JavaScript's do instead of overflowing.
pub(crate) fn hex_to_number(digits: &str) -> Option<f64> {
    if digits.is_empty() {
        return None;
    }
    digits.chars().try_fold(0.0, |acc: f64, c| {
        c.to_digit(16).map(|d| acc * 16.0 + f64::from(d))
    })
}

/// JavaScript's `String(number)`.
pub(crate) fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        return "NaN".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    if n == 0.0 {
        return "0".to_string();
    }
    let abs = n.abs();
    if (1e-6..1e21).contains(&abs) {
        return format!("{}", n);
    }
    // Exponent form: Rust renders `1e21`, JavaScript `1e+21`.
    let s = format!("{:e}", n);
    match s.split_once('e') {
        Some((mantissa, exp)) if !exp.starts_with('-') => format!("{}e+{}", mantissa, exp),
        _ => s,
    }
}

/// Resolve a (possibly negative) relative index against `len`, the way
/// `slice` does.
pub(crate) fn relative_index(index: f64, len: usize) -> usize {
    if index.is_nan() {
        return 0;
    }
    let len_f = len as f64;
    let index = index.trunc();
    let resolved = if index < 0.0 {
        (len_f + index).max(0.0)
    } else {
        index.min(len_f)
    };
    resolved as usize
}
