use std::{cmp::Ordering, collections::BTreeMap, rc::Rc};

use super::{
    parser::{BinaryOp, Expr, Literal, LogicalOp, UnaryOp},
    value::{relative_index, string_too_long, Function, Method, ObjectStatic, Scope, Value},
    ExpressionContext, FaultKind, Limits, RuntimeError,
};
use crate::snapshot::Snapshot;

type Eval = Result<Value, RuntimeError>;

/// Tree-walking evaluator for one run of one program.
///
/// An interpreter is built from scratch for every evaluation and owns all of
/// its state, so nothing leaks between runs or between resources.
pub(crate) struct Interpreter<'l> {
    limits: &'l Limits,
    globals: BTreeMap<&'static str, Value>,
    steps: u64,
    depth: usize,
    call_depth: usize,
}

impl<'l> Interpreter<'l> {
    pub fn new(limits: &'l Limits, context: &ExpressionContext<'_>) -> Self {
        let mut globals = BTreeMap::new();
        globals.insert("is_initiated", Value::Bool(context.is_initiated));
        globals.insert("values", snapshot_value(context.values));
        globals.insert("last_values", snapshot_value(context.last_values));
        globals.insert("created", keys_value(&context.diff.created));
        globals.insert("updated", keys_value(&context.diff.updated));
        globals.insert("deleted", keys_value(&context.diff.deleted));
        globals.insert("Object", Value::Function(Rc::new(Function::ObjectNamespace)));
        globals.insert("undefined", Value::Undefined);
        globals.insert("NaN", Value::Number(f64::NAN));
        globals.insert("Infinity", Value::Number(f64::INFINITY));
        Interpreter {
            limits,
            globals,
            steps: 0,
            depth: 0,
            call_depth: 0,
        }
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn run(&mut self, expr: &Expr) -> Eval {
        self.eval(expr, &Scope::default())
    }

    fn tick(&mut self) -> Result<(), RuntimeError> {
        self.steps += 1;
        if self.steps > self.limits.max_steps {
            return Err(fault(
                FaultKind::RangeError,
                format!(
                    "Execution step limit of {} exceeded",
                    self.limits.max_steps
                ),
            ));
        }
        Ok(())
    }

    /// Evaluate `expr`. Every node being evaluated, including the bodies of
    /// called functions, holds one level of `max_stack_depth`.
    fn eval(&mut self, expr: &Expr, scope: &Scope) -> Eval {
        self.tick()?;
        if self.depth >= self.limits.max_stack_depth {
            return Err(fault(
                FaultKind::RangeError,
                "Maximum call stack size exceeded",
            ));
        }
        self.depth += 1;
        let result = self.eval_node(expr, scope);
        self.depth -= 1;
        result
    }

    fn eval_node(&mut self, expr: &Expr, scope: &Scope) -> Eval {
        match expr {
            Expr::Literal(literal) => Ok(match literal {
                Literal::Number(n) => Value::Number(*n),
                Literal::Str(s) => Value::Str(s.clone()),
                Literal::Bool(b) => Value::Bool(*b),
                Literal::Null => Value::Null,
            }),
            Expr::Ident(name) => self.lookup(name, scope).ok_or_else(|| {
                fault(
                    FaultKind::ReferenceError,
                    format!("{} is not defined", name),
                )
            }),
            Expr::Array(items) => {
                let items = items
                    .iter()
                    .map(|item| self.eval(item, scope))
                    .collect::<Result<Vec<_>, _>>()?;
                self.checked_array(items)
            }
            Expr::Unary(op, operand) => self.eval_unary(*op, operand, scope),
            Expr::Binary(op, left, right) => {
                let left = self.eval(left, scope)?;
                let right = self.eval(right, scope)?;
                self.eval_binary(*op, left, right)
            }
            Expr::Logical(op, left, right) => {
                let left = self.eval(left, scope)?;
                let short_circuit = match op {
                    LogicalOp::And => !left.truthy(),
                    LogicalOp::Or => left.truthy(),
                    LogicalOp::Coalesce => !left.is_nullish(),
                };
                if short_circuit {
                    Ok(left)
                } else {
                    self.eval(right, scope)
                }
            }
            Expr::Conditional(test, consequent, alternate) => {
                if self.eval(test, scope)?.truthy() {
                    self.eval(consequent, scope)
                } else {
                    self.eval(alternate, scope)
                }
            }
            Expr::Member(object, name) => {
                let object = self.eval(object, scope)?;
                get_property(&object, name)
            }
            Expr::Index(object, index) => {
                let object = self.eval(object, scope)?;
                let index = self.eval(index, scope)?;
                match (&object, &index) {
                    (Value::Array(items), Value::Number(n)) if *n >= 0.0 && n.fract() == 0.0 => {
                        Ok(items.get(*n as usize).cloned().unwrap_or(Value::Undefined))
                    }
                    _ => get_property(&object, &self.key(&index)?),
                }
            }
            Expr::Call(callee, args) => {
                let function = self.eval(callee, scope)?;
                let args = args
                    .iter()
                    .map(|arg| self.eval(arg, scope))
                    .collect::<Result<Vec<_>, _>>()?;
                self.call(&function, args, &callee.describe())
            }
            Expr::Arrow(def) => Ok(Value::Function(Rc::new(Function::Arrow {
                def: def.clone(),
                scope: scope.clone(),
            }))),
        }
    }

    fn lookup(&self, name: &str, scope: &Scope) -> Option<Value> {
        scope
            .lookup(name)
            .or_else(|| self.globals.get(name).cloned())
    }

    fn eval_unary(&mut self, op: UnaryOp, operand: &Expr, scope: &Scope) -> Eval {
        if op == UnaryOp::TypeOf {
            // `typeof` is the one place where an undeclared name is not an error.
            if let Expr::Ident(name) = operand {
                if self.lookup(name, scope).is_none() {
                    return Ok(Value::str("undefined"));
                }
            }
        }
        let value = self.eval(operand, scope)?;
        Ok(match op {
            UnaryOp::Not => Value::Bool(!value.truthy()),
            UnaryOp::Neg => Value::Number(-value.to_number()),
            UnaryOp::Plus => Value::Number(value.to_number()),
            UnaryOp::TypeOf => Value::str(value.type_of()),
        })
    }

    fn eval_binary(&mut self, op: BinaryOp, left: Value, right: Value) -> Eval {
        let max_len = self.limits.max_string_len;
        let number = |f: fn(f64, f64) -> f64| Value::Number(f(left.to_number(), right.to_number()));
        Ok(match op {
            BinaryOp::Add => {
                let (l, r) = (left.to_primitive(max_len)?, right.to_primitive(max_len)?);
                if matches!(l, Value::Str(_)) || matches!(r, Value::Str(_)) {
                    let mut s = l.to_js_string(max_len)?;
                    r.write_js_string(&mut s, max_len)?;
                    return Ok(Value::string(s));
                }
                Value::Number(l.to_number() + r.to_number())
            }
            BinaryOp::Sub => number(|a, b| a - b),
            BinaryOp::Mul => number(|a, b| a * b),
            BinaryOp::Div => number(|a, b| a / b),
            BinaryOp::Rem => number(|a, b| a % b),
            BinaryOp::Lt => Value::Bool(left.compare(&right, max_len)? == Some(Ordering::Less)),
            BinaryOp::Gt => Value::Bool(left.compare(&right, max_len)? == Some(Ordering::Greater)),
            BinaryOp::Le => Value::Bool(matches!(
                left.compare(&right, max_len)?,
                Some(Ordering::Less | Ordering::Equal)
            )),
            BinaryOp::Ge => Value::Bool(matches!(
                left.compare(&right, max_len)?,
                Some(Ordering::Greater | Ordering::Equal)
            )),
            BinaryOp::In => {
                let key = self.key(&left)?;
                Value::Bool(match &right {
                    Value::Object(map) => map.contains_key(&key),
                    Value::Array(items) => {
                        key == "length" || array_index(&key).is_some_and(|i| i < items.len())
                    }
                    Value::Function(_) => false,
                    other => {
                        return Err(fault(
                            FaultKind::TypeError,
                            format!(
                                "Cannot use 'in' operator to search for '{}' in {}",
                                key,
                                other.describe()
                            ),
                        ))
                    }
                })
            }
            BinaryOp::LooseEq => Value::Bool(left.loose_equals(&right, max_len)?),
            BinaryOp::LooseNe => Value::Bool(!left.loose_equals(&right, max_len)?),
            BinaryOp::StrictEq => Value::Bool(left.strict_equals(&right)),
            BinaryOp::StrictNe => Value::Bool(!left.strict_equals(&right)),
        })
    }

    fn call(&mut self, function: &Value, args: Vec<Value>, name: &str) -> Eval {
        let function = match function {
            Value::Function(f) => f.clone(),
            _ => {
                return Err(fault(
                    FaultKind::TypeError,
                    format!("{} is not a function", name),
                ))
            }
        };
        match &*function {
            Function::Arrow { def, scope } => {
                if self.call_depth >= self.limits.max_call_depth {
                    return Err(fault(
                        FaultKind::RangeError,
                        "Maximum call stack size exceeded",
                    ));
                }
                let mut args = args.into_iter();
                let bindings = def
                    .params
                    .iter()
                    .map(|p| (p.clone(), args.next().unwrap_or(Value::Undefined)))
                    .collect();
                let scope = scope.with(bindings);
                self.call_depth += 1;
                let result = self.eval(&def.body, &scope);
                self.call_depth -= 1;
                result
            }
            Function::Method { receiver, method } => self.call_method(receiver, *method, args),
            Function::ObjectNamespace => Err(fault(
                FaultKind::TypeError,
                "Object() is not supported in commit expressions",
            )),
            Function::ObjectStatic(which) => self.call_object_static(*which, args),
        }
    }

    fn call_object_static(&mut self, which: ObjectStatic, args: Vec<Value>) -> Eval {
        let entries: Vec<(String, Value)> = match args.into_iter().next() {
            None | Some(Value::Undefined) | Some(Value::Null) => {
                return Err(fault(
                    FaultKind::TypeError,
                    "Cannot convert undefined or null to object",
                ))
            }
            Some(Value::Object(map)) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            Some(Value::Array(items)) => items
                .iter()
                .enumerate()
                .map(|(i, v)| (i.to_string(), v.clone()))
                .collect(),
            Some(Value::Str(s)) => utf16_units(&s)
                .iter()
                .enumerate()
                .map(|(i, unit)| (i.to_string(), Value::string(String::from_utf16_lossy(&[*unit]))))
                .collect(),
            Some(_) => Vec::new(),
        };
        let items = entries
            .into_iter()
            .map(|(k, v)| match which {
                ObjectStatic::Keys => Value::string(k),
                ObjectStatic::Values => v,
                ObjectStatic::Entries => Value::array(vec![Value::string(k), v]),
            })
            .collect();
        self.checked_array(items)
    }

    fn call_method(&mut self, receiver: &Value, method: Method, args: Vec<Value>) -> Eval {
        let arg = |i: usize| args.get(i).cloned().unwrap_or(Value::Undefined);
        match (receiver, method) {
            (Value::Array(items), Method::Includes) => {
                let needle = arg(0);
                Ok(Value::Bool(items.iter().any(|v| v.same_value_zero(&needle))))
            }
            (Value::Array(items), Method::IndexOf) => {
                let needle = arg(0);
                Ok(Value::Number(
                    items
                        .iter()
                        .position(|v| v.strict_equals(&needle))
                        .map_or(-1.0, |i| i as f64),
                ))
            }
            (Value::Array(items), Method::Join) => {
                let separator = match arg(0) {
                    Value::Undefined => Value::str(","),
                    other => other,
                };
                let max_len = self.limits.max_string_len;
                let mut joined = String::new();
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        separator.write_js_string(&mut joined, max_len)?;
                    }
                    if !item.is_nullish() {
                        item.write_js_string(&mut joined, max_len)?;
                    }
                }
                Ok(Value::string(joined))
            }
            (Value::Array(items), Method::Some) => {
                let callback = arg(0);
                for (i, item) in items.iter().enumerate() {
                    if self.callback(&callback, receiver, i, item)?.truthy() {
                        return Ok(Value::Bool(true));
                    }
                }
                Ok(Value::Bool(false))
            }
            (Value::Array(items), Method::Every) => {
                let callback = arg(0);
                for (i, item) in items.iter().enumerate() {
                    if !self.callback(&callback, receiver, i, item)?.truthy() {
                        return Ok(Value::Bool(false));
                    }
                }
                Ok(Value::Bool(true))
            }
            (Value::Array(items), Method::Filter) => {
                let callback = arg(0);
                let mut kept = Vec::new();
                for (i, item) in items.iter().enumerate() {
                    if self.callback(&callback, receiver, i, item)?.truthy() {
                        kept.push(item.clone());
                    }
                }
                Ok(Value::array(kept))
            }
            (Value::Array(items), Method::Map) => {
                let callback = arg(0);
                let mut mapped = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    mapped.push(self.callback(&callback, receiver, i, item)?);
                }
                Ok(Value::array(mapped))
            }
            (Value::Array(items), Method::Find) => {
                let callback = arg(0);
                for (i, item) in items.iter().enumerate() {
                    if self.callback(&callback, receiver, i, item)?.truthy() {
                        return Ok(item.clone());
                    }
                }
                Ok(Value::Undefined)
            }
            (Value::Array(items), Method::Concat) => {
                let mut result = items.to_vec();
                for extra in args.iter() {
                    match extra {
                        Value::Array(more) => result.extend(more.iter().cloned()),
                        other => result.push(other.clone()),
                    }
                    if result.len() > self.limits.max_array_len {
                        return self.checked_array(result);
                    }
                }
                self.checked_array(result)
            }
            (Value::Array(items), Method::Slice) => {
                let (start, end) = slice_bounds(&arg(0), &arg(1), items.len());
                Ok(Value::array(
                    items.get(start..end).map(<[Value]>::to_vec).unwrap_or_default(),
                ))
            }
            (Value::Str(s), Method::StrIncludes) => {
                Ok(Value::Bool(s.contains(self.key(&arg(0))?.as_str())))
            }
            (Value::Str(s), Method::StartsWith) => {
                Ok(Value::Bool(s.starts_with(self.key(&arg(0))?.as_str())))
            }
            (Value::Str(s), Method::EndsWith) => {
                Ok(Value::Bool(s.ends_with(self.key(&arg(0))?.as_str())))
            }
            (Value::Str(s), Method::StrIndexOf) => {
                let needle = self.key(&arg(0))?;
                Ok(Value::Number(match s.find(needle.as_str()) {
                    Some(byte_index) => s[..byte_index].encode_utf16().count() as f64,
                    None => -1.0,
                }))
            }
            (Value::Str(s), Method::ToUpperCase) => self.checked_string(s.to_uppercase()),
            (Value::Str(s), Method::ToLowerCase) => self.checked_string(s.to_lowercase()),
            (Value::Str(s), Method::Trim) => Ok(Value::str(s.trim())),
            (Value::Str(s), Method::StrSlice) => {
                let units = utf16_units(s);
                let (start, end) = slice_bounds(&arg(0), &arg(1), units.len());
                Ok(Value::string(String::from_utf16_lossy(
                    units.get(start..end).unwrap_or_default(),
                )))
            }
            (Value::Object(map), Method::HasOwnProperty) => {
                Ok(Value::Bool(map.contains_key(&self.key(&arg(0))?)))
            }
            (other, method) => Err(fault(
                FaultKind::TypeError,
                format!("{:?} is not applicable to {}", method, other.type_of()),
            )),
        }
    }

    fn callback(&mut self, callback: &Value, array: &Value, index: usize, item: &Value) -> Eval {
        let args = vec![item.clone(), Value::Number(index as f64), array.clone()];
        let name = match callback {
            Value::Function(_) => "callback".to_string(),
            other => other.describe(),
        };
        self.call(callback, args, &name)
    }

    fn checked_string(&self, s: String) -> Eval {
        if s.len() > self.limits.max_string_len {
            return Err(string_too_long(s.len(), self.limits.max_string_len));
        }
        Ok(Value::string(s))
    }

    /// The string a value denotes as a property key or a search argument.
    fn key(&self, value: &Value) -> Result<String, RuntimeError> {
        match value {
            Value::Str(s) => Ok(s.to_string()),
            other => other.to_js_string(self.limits.max_string_len),
        }
    }

    fn checked_array(&self, items: Vec<Value>) -> Eval {
        if items.len() > self.limits.max_array_len {
            return Err(fault(
                FaultKind::RangeError,
                format!(
                    "Invalid array length: {} exceeds the limit of {}",
                    items.len(),
                    self.limits.max_array_len
                ),
            ));
        }
        Ok(Value::array(items))
    }
}

fn get_property(object: &Value, key: &str) -> Eval {
    let method = |m: Option<Method>| match m {
        Some(method) => Value::Function(Rc::new(Function::Method {
            receiver: object.clone(),
            method,
        })),
        None => Value::Undefined,
    };
    Ok(match object {
        Value::Undefined | Value::Null => {
            return Err(fault(
                FaultKind::TypeError,
                format!(
                    "Cannot read properties of {} (reading '{}')",
                    object.describe(),
                    key
                ),
            ))
        }
        Value::Str(s) => {
            if key == "length" {
                Value::Number(s.encode_utf16().count() as f64)
            } else if let Some(i) = array_index(key) {
                utf16_units(s)
                    .get(i)
                    .map(|unit| Value::string(String::from_utf16_lossy(&[*unit])))
                    .unwrap_or(Value::Undefined)
            } else {
                method(Method::for_string(key))
            }
        }
        Value::Array(items) => {
            if key == "length" {
                Value::Number(items.len() as f64)
            } else if let Some(i) = array_index(key) {
                items.get(i).cloned().unwrap_or(Value::Undefined)
            } else {
                method(Method::for_array(key))
            }
        }
        Value::Object(map) => match map.get(key) {
            Some(v) => v.clone(),
            None => method(Method::for_object(key)),
        },
        Value::Function(f) => match (&**f, key) {
            (Function::ObjectNamespace, "keys") => static_fn(ObjectStatic::Keys),
            (Function::ObjectNamespace, "values") => static_fn(ObjectStatic::Values),
            (Function::ObjectNamespace, "entries") => static_fn(ObjectStatic::Entries),
            _ => Value::Undefined,
        },
        Value::Bool(_) | Value::Number(_) => Value::Undefined,
    })
}

fn static_fn(which: ObjectStatic) -> Value {
    Value::Function(Rc::new(Function::ObjectStatic(which)))
}

/// A canonical array index: digits only, no leading zeros.
fn array_index(key: &str) -> Option<usize> {
    let index = key.parse::<usize>().ok()?;
    if index.to_string() == key {
        Some(index)
    } else {
        None
    }
}

fn slice_bounds(start: &Value, end: &Value, len: usize) -> (usize, usize) {
    let start = match start {
        Value::Undefined => 0,
        v => relative_index(v.to_number(), len),
    };
    let end = match end {
        Value::Undefined => len,
        v => relative_index(v.to_number(), len),
    };
    (start, end.max(start))
}

fn utf16_units(s: &str) -> Vec<u16> {
    s.encode_utf16().collect()
}

fn snapshot_value(snapshot: &Snapshot) -> Value {
    Value::Object(Rc::new(
        snapshot
            .iter()
            .map(|(k, v)| (k.clone(), Value::str(v)))
            .collect(),
    ))
}

fn keys_value(keys: &[String]) -> Value {
    Value::array(keys.iter().map(|k| Value::str(k)).collect())
}

fn fault(kind: FaultKind, message: impl Into<String>) -> RuntimeError {
    RuntimeError {
        kind,
        message: message.into(),
    }
}
