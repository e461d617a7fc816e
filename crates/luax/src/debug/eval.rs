// Breakpoint condition, hit-condition, and log-template evaluation.
//
// Conditions are a single comparison over literals and variable names
// (`i == 7`, `count >= limit`, `flag`), resolved against the paused
// frame's locals, upvalues, and globals. Evaluation never runs Lua code
// and never pauses; errors are reported to the caller, which treats the
// breakpoint as skipped.

use crate::lua_value::{parse_lua_number, LuaValue};

type Resolver<'a> = dyn Fn(&str) -> Option<LuaValue> + 'a;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

fn split_condition(text: &str) -> Option<(&str, CmpOp, &str)> {
    // Two-character operators first so "<=" does not parse as "<"
    for (token, op) in [
        ("==", CmpOp::Eq),
        ("~=", CmpOp::Ne),
        ("!=", CmpOp::Ne),
        ("<=", CmpOp::Le),
        (">=", CmpOp::Ge),
        ("<", CmpOp::Lt),
        (">", CmpOp::Gt),
    ] {
        if let Some(pos) = text.find(token) {
            let left = &text[..pos];
            let right = &text[pos + token.len()..];
            return Some((left.trim(), op, right.trim()));
        }
    }
    None
}

fn parse_operand(text: &str, resolver: &Resolver) -> Result<LuaValue, String> {
    let text = text.trim();
    if text.is_empty() {
        return Err("empty operand".to_string());
    }
    match text {
        "nil" => return Ok(LuaValue::Nil),
        "true" => return Ok(LuaValue::Boolean(true)),
        "false" => return Ok(LuaValue::Boolean(false)),
        _ => {}
    }
    if let Some(n) = parse_lua_number(text) {
        return Ok(LuaValue::Number(n));
    }
    if let Some(stripped) = text
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .or_else(|| text.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')))
    {
        return Ok(LuaValue::String(std::rc::Rc::new(
            crate::lua_value::LuaString::new(stripped),
        )));
    }
    // A name, possibly a dotted path followed through raw table reads
    let mut parts = text.split('.');
    let first = parts.next().unwrap_or(text);
    if !is_name(first) {
        return Err(format!("cannot parse operand '{}'", text));
    }
    let mut value = resolver(first).unwrap_or(LuaValue::Nil);
    for part in parts {
        if !is_name(part) {
            return Err(format!("cannot parse operand '{}'", text));
        }
        value = match &value {
            LuaValue::Table(t) => {
                let key = LuaValue::String(std::rc::Rc::new(
                    crate::lua_value::LuaString::new(part),
                ));
                t.borrow().get(&key)
            }
            _ => return Err(format!("'{}' is not a table", first)),
        };
    }
    Ok(value)
}

fn is_name(s: &str) -> bool {
    !s.is_empty()
        && s.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn compare(op: CmpOp, a: &LuaValue, b: &LuaValue) -> Result<bool, String> {
    match op {
        CmpOp::Eq => Ok(a.raw_equal(b)),
        CmpOp::Ne => Ok(!a.raw_equal(b)),
        _ => {
            let ordering = match (a, b) {
                (LuaValue::Number(x), LuaValue::Number(y)) => x.partial_cmp(y),
                (LuaValue::String(x), LuaValue::String(y)) => {
                    Some(x.as_str().as_bytes().cmp(y.as_str().as_bytes()))
                }
                _ => {
                    return Err(format!(
                        "attempt to compare {} with {}",
                        a.type_name(),
                        b.type_name()
                    ))
                }
            };
            let Some(ordering) = ordering else {
                return Ok(false); // NaN comparisons are false
            };
            Ok(match op {
                CmpOp::Lt => ordering.is_lt(),
                CmpOp::Le => ordering.is_le(),
                CmpOp::Gt => ordering.is_gt(),
                CmpOp::Ge => ordering.is_ge(),
                CmpOp::Eq | CmpOp::Ne => false,
            })
        }
    }
}

/// Evaluate a breakpoint condition. A single operand is tested for
/// truthiness; a comparison is evaluated with raw semantics.
pub fn eval_condition(text: &str, resolver: &Resolver) -> Result<bool, String> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(true);
    }
    match split_condition(text) {
        Some((left, op, right)) => {
            let a = parse_operand(left, resolver)?;
            let b = parse_operand(right, resolver)?;
            compare(op, &a, &b)
        }
        None => Ok(parse_operand(text, resolver)?.is_truthy()),
    }
}

/// Hit conditions: `N` (== N), `== N`, `> N`, `>= N`, `< N`, `<= N`,
/// and `% N` (every N-th hit).
pub fn eval_hit_condition(text: &str, count: u64) -> Result<bool, String> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(true);
    }
    let (op, rest) = if let Some(rest) = text.strip_prefix("==") {
        ("==", rest)
    } else if let Some(rest) = text.strip_prefix(">=") {
        (">=", rest)
    } else if let Some(rest) = text.strip_prefix("<=") {
        ("<=", rest)
    } else if let Some(rest) = text.strip_prefix('>') {
        (">", rest)
    } else if let Some(rest) = text.strip_prefix('<') {
        ("<", rest)
    } else if let Some(rest) = text.strip_prefix('%') {
        ("%", rest)
    } else {
        ("==", text)
    };
    let n: u64 = rest
        .trim()
        .parse()
        .map_err(|_| format!("cannot parse hit condition '{}'", text))?;
    Ok(match op {
        "==" => count == n,
        ">=" => count >= n,
        "<=" => count <= n,
        ">" => count > n,
        "<" => count < n,
        "%" => n != 0 && count % n == 0,
        _ => false,
    })
}

/// Render a log template, replacing `{name}` with the resolved value.
/// `{{` and `}}` escape literal braces.
pub fn render_log_template(template: &str, resolver: &Resolver) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut name = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    name.push(c);
                }
                if closed {
                    match resolver(name.trim()) {
                        Some(v) => out.push_str(&v.to_string()),
                        None => out.push_str("nil"),
                    }
                } else {
                    out.push('{');
                    out.push_str(&name);
                }
            }
            _ => out.push(c),
        }
    }
    out
}
