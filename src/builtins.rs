//! Native (Rust) built-in values for the Ark VM.
//!
//! The registry is an *ordered* list: the compiler encodes a builtin
//! reference as its position in [`all`], and the VM's `BUILTIN id`
//! instruction pushes the value at that position.  Reordering entries
//! therefore changes the bytecode ABI; new builtins go at the end.
//!
//! Each native is a plain Rust function with the signature
//! `fn(&[Value]) -> Result<Value, String>`, receiving the evaluated
//! arguments in source order.
//!
//! # Organisation
//!
//! | Group  | Entries |
//! |--------|---------|
//! | Consts | `nil`, `true`, `false` |
//! | IO     | `print`, `puts`, `input` |
//! | List   | `list:reverse`, `list:find`, `list:slice`, `list:sort`, `list:fill`, `list:setAt` |
//! | String | `str:find`, `str:removeAt`, `str:ord`, `str:chr` |
//! | Math   | `math:floor`, `math:ceil`, `math:round`, `math:pow`, `math:sqrt` |
//! | Sys    | `time` |

use std::io::{BufRead, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::value::{NativeFn, Value};

// ─────────────────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────────────────

/// The full builtin registry, in ABI order.
pub fn all() -> Vec<(&'static str, Value)> {
    vec![
        // ── Constants ────────────────────────────────────────────────────────
        ("nil", Value::Nil),
        ("true", Value::True),
        ("false", Value::False),
        // ── IO ───────────────────────────────────────────────────────────────
        ("print", Value::Builtin(io_print as NativeFn)),
        ("puts", Value::Builtin(io_puts as NativeFn)),
        ("input", Value::Builtin(io_input as NativeFn)),
        // ── List ─────────────────────────────────────────────────────────────
        ("list:reverse", Value::Builtin(list_reverse as NativeFn)),
        ("list:find", Value::Builtin(list_find as NativeFn)),
        ("list:slice", Value::Builtin(list_slice as NativeFn)),
        ("list:sort", Value::Builtin(list_sort as NativeFn)),
        ("list:fill", Value::Builtin(list_fill as NativeFn)),
        ("list:setAt", Value::Builtin(list_set_at as NativeFn)),
        // ── String ───────────────────────────────────────────────────────────
        ("str:find", Value::Builtin(str_find as NativeFn)),
        ("str:removeAt", Value::Builtin(str_remove_at as NativeFn)),
        ("str:ord", Value::Builtin(str_ord as NativeFn)),
        ("str:chr", Value::Builtin(str_chr as NativeFn)),
        // ── Math ─────────────────────────────────────────────────────────────
        ("math:floor", Value::Builtin(math_floor as NativeFn)),
        ("math:ceil", Value::Builtin(math_ceil as NativeFn)),
        ("math:round", Value::Builtin(math_round as NativeFn)),
        ("math:pow", Value::Builtin(math_pow as NativeFn)),
        ("math:sqrt", Value::Builtin(math_sqrt as NativeFn)),
        // ── Sys ──────────────────────────────────────────────────────────────
        ("time", Value::Builtin(sys_time as NativeFn)),
    ]
}

/// Position of `name` in the registry, if it is a builtin.
pub fn index_of(name: &str, registry: &[(&'static str, Value)]) -> Option<u16> {
    registry
        .iter()
        .position(|(entry, _)| *entry == name)
        .map(|i| i as u16)
}

// ─────────────────────────────────────────────────────────────────────────────
// Argument helpers
// ─────────────────────────────────────────────────────────────────────────────

fn want(args: &[Value], n: usize, who: &str) -> Result<(), String> {
    if args.len() != n {
        return Err(format!("{who}: expected {n} argument(s), got {}", args.len()));
    }
    Ok(())
}

fn as_number(value: &Value, who: &str) -> Result<f64, String> {
    match value {
        Value::Number(n) => Ok(*n),
        other => Err(format!("{who}: expected a Number, got {}", other.type_name())),
    }
}

fn as_string<'a>(value: &'a Value, who: &str) -> Result<&'a str, String> {
    match value {
        Value::Str(s) => Ok(s.as_str()),
        other => Err(format!("{who}: expected a String, got {}", other.type_name())),
    }
}

fn as_list(value: &Value, who: &str) -> Result<Vec<Value>, String> {
    match value {
        Value::List(items) => Ok(items.borrow().clone()),
        other => Err(format!("{who}: expected a List, got {}", other.type_name())),
    }
}

/// Resolve a possibly negative index against `len`.
fn resolve_index(idx: f64, len: usize, who: &str) -> Result<usize, String> {
    let idx = idx as i64;
    let resolved = if idx < 0 { len as i64 + idx } else { idx };
    if resolved < 0 || resolved as usize >= len {
        return Err(format!("{who}: index {idx} out of range (length {len})"));
    }
    Ok(resolved as usize)
}

// ─────────────────────────────────────────────────────────────────────────────
// IO
// ─────────────────────────────────────────────────────────────────────────────

fn io_print(args: &[Value]) -> Result<Value, String> {
    io_puts(args)?;
    println!();
    Ok(Value::Nil)
}

fn io_puts(args: &[Value]) -> Result<Value, String> {
    let mut out = std::io::stdout().lock();
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            write!(out, " ").map_err(|e| e.to_string())?;
        }
        write!(out, "{arg}").map_err(|e| e.to_string())?;
    }
    out.flush().map_err(|e| e.to_string())?;
    Ok(Value::Nil)
}

fn io_input(args: &[Value]) -> Result<Value, String> {
    if let Some(prompt) = args.first() {
        print!("{prompt}");
        std::io::stdout().flush().map_err(|e| e.to_string())?;
    }
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .map_err(|e| e.to_string())?;
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(Value::string(line))
}

// ─────────────────────────────────────────────────────────────────────────────
// List
// ─────────────────────────────────────────────────────────────────────────────

fn list_reverse(args: &[Value]) -> Result<Value, String> {
    want(args, 1, "list:reverse")?;
    let mut items = as_list(&args[0], "list:reverse")?;
    items.reverse();
    Ok(Value::list(items))
}

fn list_find(args: &[Value]) -> Result<Value, String> {
    want(args, 2, "list:find")?;
    let items = as_list(&args[0], "list:find")?;
    let index = items
        .iter()
        .position(|item| *item == args[1])
        .map(|i| i as f64)
        .unwrap_or(-1.0);
    Ok(Value::Number(index))
}

fn list_slice(args: &[Value]) -> Result<Value, String> {
    want(args, 3, "list:slice")?;
    let items = as_list(&args[0], "list:slice")?;
    let start = resolve_index(as_number(&args[1], "list:slice")?, items.len() + 1, "list:slice")?;
    let end = resolve_index(as_number(&args[2], "list:slice")?, items.len() + 1, "list:slice")?;
    if start > end {
        return Err(format!("list:slice: start {start} is past end {end}"));
    }
    Ok(Value::list(items[start..end].to_vec()))
}

fn list_sort(args: &[Value]) -> Result<Value, String> {
    want(args, 1, "list:sort")?;
    let mut items = as_list(&args[0], "list:sort")?;
    let mut failed = false;
    items.sort_by(|a, b| {
        a.partial_cmp(b).unwrap_or_else(|| {
            failed = true;
            std::cmp::Ordering::Equal
        })
    });
    if failed {
        return Err("list:sort: elements are not comparable".to_string());
    }
    Ok(Value::list(items))
}

fn list_fill(args: &[Value]) -> Result<Value, String> {
    want(args, 2, "list:fill")?;
    let count = as_number(&args[0], "list:fill")?;
    if count < 0.0 {
        return Err("list:fill: count must not be negative".to_string());
    }
    Ok(Value::list(vec![args[1].clone(); count as usize]))
}

fn list_set_at(args: &[Value]) -> Result<Value, String> {
    want(args, 3, "list:setAt")?;
    let mut items = as_list(&args[0], "list:setAt")?;
    let index = resolve_index(as_number(&args[1], "list:setAt")?, items.len(), "list:setAt")?;
    items[index] = args[2].clone();
    Ok(Value::list(items))
}

// ─────────────────────────────────────────────────────────────────────────────
// String
// ─────────────────────────────────────────────────────────────────────────────

fn str_find(args: &[Value]) -> Result<Value, String> {
    want(args, 2, "str:find")?;
    let haystack = as_string(&args[0], "str:find")?;
    let needle = as_string(&args[1], "str:find")?;
    let index = haystack
        .find(needle)
        .map(|byte| haystack[..byte].chars().count() as f64)
        .unwrap_or(-1.0);
    Ok(Value::Number(index))
}

fn str_remove_at(args: &[Value]) -> Result<Value, String> {
    want(args, 2, "str:removeAt")?;
    let s = as_string(&args[0], "str:removeAt")?;
    let chars: Vec<char> = s.chars().collect();
    let index = resolve_index(as_number(&args[1], "str:removeAt")?, chars.len(), "str:removeAt")?;
    let out: String = chars
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != index)
        .map(|(_, c)| c)
        .collect();
    Ok(Value::string(out))
}

fn str_ord(args: &[Value]) -> Result<Value, String> {
    want(args, 1, "str:ord")?;
    let s = as_string(&args[0], "str:ord")?;
    match s.chars().next() {
        Some(c) => Ok(Value::Number(c as u32 as f64)),
        None => Err("str:ord: empty string".to_string()),
    }
}

fn str_chr(args: &[Value]) -> Result<Value, String> {
    want(args, 1, "str:chr")?;
    let code = as_number(&args[0], "str:chr")? as u32;
    match char::from_u32(code) {
        Some(c) => Ok(Value::string(c.to_string())),
        None => Err(format!("str:chr: {code} is not a valid character code")),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Math
// ─────────────────────────────────────────────────────────────────────────────

fn math_floor(args: &[Value]) -> Result<Value, String> {
    want(args, 1, "math:floor")?;
    Ok(Value::Number(as_number(&args[0], "math:floor")?.floor()))
}

fn math_ceil(args: &[Value]) -> Result<Value, String> {
    want(args, 1, "math:ceil")?;
    Ok(Value::Number(as_number(&args[0], "math:ceil")?.ceil()))
}

fn math_round(args: &[Value]) -> Result<Value, String> {
    want(args, 1, "math:round")?;
    Ok(Value::Number(as_number(&args[0], "math:round")?.round()))
}

fn math_pow(args: &[Value]) -> Result<Value, String> {
    want(args, 2, "math:pow")?;
    let base = as_number(&args[0], "math:pow")?;
    let exponent = as_number(&args[1], "math:pow")?;
    Ok(Value::Number(base.powf(exponent)))
}

fn math_sqrt(args: &[Value]) -> Result<Value, String> {
    want(args, 1, "math:sqrt")?;
    Ok(Value::Number(as_number(&args[0], "math:sqrt")?.sqrt()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Sys
// ─────────────────────────────────────────────────────────────────────────────

fn sys_time(args: &[Value]) -> Result<Value, String> {
    want(args, 0, "time")?;
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| e.to_string())?;
    Ok(Value::Number(now.as_secs_f64()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants_lead_the_registry() {
        let registry = all();
        assert_eq!(registry[0].0, "nil");
        assert_eq!(registry[0].1, Value::Nil);
        assert_eq!(index_of("nil", &registry), Some(0));
        assert_eq!(index_of("no-such-builtin", &registry), None);
    }

    #[test]
    fn test_list_builtins_do_not_mutate_their_input() {
        let input = Value::list(vec![Value::Number(1.0), Value::Number(2.0)]);
        let reversed = list_reverse(&[input.clone()]).unwrap();
        assert_eq!(
            reversed,
            Value::list(vec![Value::Number(2.0), Value::Number(1.0)])
        );
        assert_eq!(
            input,
            Value::list(vec![Value::Number(1.0), Value::Number(2.0)])
        );
    }

    #[test]
    fn test_list_find() {
        let list = Value::list(vec![Value::Number(1.0), Value::string("x")]);
        assert_eq!(
            list_find(&[list.clone(), Value::string("x")]).unwrap(),
            Value::Number(1.0)
        );
        assert_eq!(
            list_find(&[list, Value::Number(9.0)]).unwrap(),
            Value::Number(-1.0)
        );
    }

    #[test]
    fn test_list_set_at_negative_index() {
        let list = Value::list(vec![Value::Number(1.0), Value::Number(2.0)]);
        let out = list_set_at(&[list, Value::Number(-1.0), Value::Number(9.0)]).unwrap();
        assert_eq!(
            out,
            Value::list(vec![Value::Number(1.0), Value::Number(9.0)])
        );
    }

    #[test]
    fn test_str_helpers() {
        assert_eq!(
            str_find(&[Value::string("hello"), Value::string("ll")]).unwrap(),
            Value::Number(2.0)
        );
        assert_eq!(
            str_remove_at(&[Value::string("abc"), Value::Number(1.0)]).unwrap(),
            Value::string("ac")
        );
        assert_eq!(str_ord(&[Value::string("A")]).unwrap(), Value::Number(65.0));
        assert_eq!(str_chr(&[Value::Number(65.0)]).unwrap(), Value::string("A"));
    }

    #[test]
    fn test_type_errors_carry_the_builtin_name() {
        let err = list_reverse(&[Value::Number(1.0)]).unwrap_err();
        assert!(err.contains("list:reverse"));
        let err = math_sqrt(&[]).unwrap_err();
        assert!(err.contains("math:sqrt"));
    }
}
