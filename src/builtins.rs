// File: src/builtins.rs
//
// Standard library: the native function signatures registered for
// type-checking (§6.3) and the host closures backing them at runtime
// (A.3). Grounded on examples/original_source/src/StdLib.{hpp,cpp} —
// the descriptor list here (name, param types, return type, arity) is a
// direct port of `standardLibraryNatives()`.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::type_info::{TypeInfo, TypeRef};
use crate::value::Value;

/// One entry per native: its name, declared parameter types (empty means
/// variadic/unconstrained, matching `arity == -1`), return type, and
/// arity (-1 for variadic).
pub struct NativeDescriptor {
    pub name: &'static str,
    pub param_types: Vec<TypeRef>,
    pub return_type: TypeRef,
    pub arity: i32,
}

pub fn standard_library_natives() -> Vec<NativeDescriptor> {
    vec![
        NativeDescriptor { name: "clock", param_types: vec![], return_type: TypeInfo::make_f64(), arity: 0 },
        NativeDescriptor {
            name: "sqrt",
            param_types: vec![TypeInfo::make_f64()],
            return_type: TypeInfo::make_f64(),
            arity: 1,
        },
        NativeDescriptor {
            name: "len",
            param_types: vec![TypeInfo::make_any()],
            return_type: TypeInfo::make_i64(),
            arity: 1,
        },
        NativeDescriptor {
            name: "error",
            param_types: vec![TypeInfo::make_str()],
            return_type: TypeInfo::make_void(),
            arity: 1,
        },
        NativeDescriptor {
            name: "num",
            param_types: vec![TypeInfo::make_any()],
            return_type: TypeInfo::make_f64(),
            arity: 1,
        },
        NativeDescriptor {
            name: "type",
            param_types: vec![TypeInfo::make_any()],
            return_type: TypeInfo::make_str(),
            arity: 1,
        },
        NativeDescriptor {
            name: "str",
            param_types: vec![TypeInfo::make_any()],
            return_type: TypeInfo::make_str(),
            arity: 1,
        },
        NativeDescriptor {
            name: "toString",
            param_types: vec![TypeInfo::make_any()],
            return_type: TypeInfo::make_str(),
            arity: 1,
        },
        NativeDescriptor {
            name: "parseInt",
            param_types: vec![TypeInfo::make_str()],
            return_type: TypeInfo::make_i64(),
            arity: 1,
        },
        NativeDescriptor {
            name: "parseUInt",
            param_types: vec![TypeInfo::make_str()],
            return_type: TypeInfo::make_u64(),
            arity: 1,
        },
        NativeDescriptor {
            name: "parseFloat",
            param_types: vec![TypeInfo::make_str()],
            return_type: TypeInfo::make_f64(),
            arity: 1,
        },
        NativeDescriptor {
            name: "abs",
            param_types: vec![TypeInfo::make_f64()],
            return_type: TypeInfo::make_f64(),
            arity: 1,
        },
        NativeDescriptor {
            name: "floor",
            param_types: vec![TypeInfo::make_f64()],
            return_type: TypeInfo::make_f64(),
            arity: 1,
        },
        NativeDescriptor {
            name: "ceil",
            param_types: vec![TypeInfo::make_f64()],
            return_type: TypeInfo::make_f64(),
            arity: 1,
        },
        NativeDescriptor {
            name: "pow",
            param_types: vec![TypeInfo::make_f64(), TypeInfo::make_f64()],
            return_type: TypeInfo::make_f64(),
            arity: 2,
        },
        NativeDescriptor {
            name: "Set",
            param_types: vec![],
            return_type: TypeInfo::make_set(TypeInfo::make_any()),
            arity: -1,
        },
    ]
}

pub fn function_type_for(descriptor: &NativeDescriptor) -> TypeRef {
    TypeInfo::make_function(descriptor.param_types.clone(), descriptor.return_type.clone())
}

fn native_clock(_args: &[Value]) -> Result<Value, String> {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).map_err(|e| e.to_string())?;
    Ok(Value::Number(now.as_secs_f64()))
}

fn expect_number(args: &[Value], index: usize, who: &str) -> Result<f64, String> {
    args.get(index)
        .and_then(Value::as_number)
        .ok_or_else(|| format!("{} expects a numeric argument at position {}.", who, index))
}

fn native_sqrt(args: &[Value]) -> Result<Value, String> {
    Ok(Value::Number(expect_number(args, 0, "sqrt")?.sqrt()))
}

fn native_len(args: &[Value]) -> Result<Value, String> {
    let value = args.first().ok_or("len expects one argument.")?;
    let n = match value {
        Value::Str(s) => s.chars().count(),
        Value::Object(obj) => match &*obj.data() {
            crate::value::ObjData::Array(a) => a.elements.borrow().len(),
            crate::value::ObjData::Dict(d) => d.entries.borrow().len(),
            crate::value::ObjData::Set(s) => s.elements.borrow().len(),
            _ => return Err("len: unsupported value.".to_string()),
        },
        _ => return Err("len: unsupported value.".to_string()),
    };
    Ok(Value::Number(n as f64))
}

fn native_error(args: &[Value]) -> Result<Value, String> {
    let msg = args.first().map(|v| v.to_string()).unwrap_or_default();
    Err(msg)
}

fn native_num(args: &[Value]) -> Result<Value, String> {
    let value = args.first().ok_or("num expects one argument.")?;
    match value {
        Value::Number(n) => Ok(Value::Number(*n)),
        Value::Bool(b) => Ok(Value::Number(if *b { 1.0 } else { 0.0 })),
        Value::Str(s) => s.trim().parse::<f64>().map(Value::Number).map_err(|_| format!("Cannot convert '{}' to a number.", s)),
        _ => Err("Cannot convert value to a number.".to_string()),
    }
}

fn native_type(args: &[Value]) -> Result<Value, String> {
    let value = args.first().ok_or("type expects one argument.")?;
    Ok(Value::str(value.type_name()))
}

fn native_str(args: &[Value]) -> Result<Value, String> {
    let value = args.first().ok_or("str expects one argument.")?;
    Ok(Value::str(value.to_string()))
}

fn native_parse_int(args: &[Value]) -> Result<Value, String> {
    let s = args.first().and_then(Value::as_str).ok_or("parseInt expects a string.")?;
    s.trim().parse::<i64>().map(|n| Value::Number(n as f64)).map_err(|_| format!("Cannot parse '{}' as an integer.", s))
}

fn native_parse_uint(args: &[Value]) -> Result<Value, String> {
    let s = args.first().and_then(Value::as_str).ok_or("parseUInt expects a string.")?;
    s.trim().parse::<u64>().map(|n| Value::Number(n as f64)).map_err(|_| format!("Cannot parse '{}' as an unsigned integer.", s))
}

fn native_parse_float(args: &[Value]) -> Result<Value, String> {
    let s = args.first().and_then(Value::as_str).ok_or("parseFloat expects a string.")?;
    s.trim().parse::<f64>().map(Value::Number).map_err(|_| format!("Cannot parse '{}' as a float.", s))
}

fn native_abs(args: &[Value]) -> Result<Value, String> {
    Ok(Value::Number(expect_number(args, 0, "abs")?.abs()))
}

fn native_floor(args: &[Value]) -> Result<Value, String> {
    Ok(Value::Number(expect_number(args, 0, "floor")?.floor()))
}

fn native_ceil(args: &[Value]) -> Result<Value, String> {
    Ok(Value::Number(expect_number(args, 0, "ceil")?.ceil()))
}

fn native_pow(args: &[Value]) -> Result<Value, String> {
    let base = expect_number(args, 0, "pow")?;
    let exp = expect_number(args, 1, "pow")?;
    Ok(Value::Number(base.powf(exp)))
}

/// Looks up the native implementation by name; the VM allocates the
/// `NativeFunctionObject` (it needs GC bookkeeping), this just supplies
/// the function pointer and declared arity.
pub fn native_fn(name: &str) -> Option<(crate::value::NativeFn, i32)> {
    Some(match name {
        "clock" => (native_clock as crate::value::NativeFn, 0),
        "sqrt" => (native_sqrt, 1),
        "len" => (native_len, 1),
        "error" => (native_error, 1),
        "num" => (native_num, 1),
        "type" => (native_type, 1),
        "str" => (native_str, 1),
        "toString" => (native_str, 1),
        "parseInt" => (native_parse_int, 1),
        "parseUInt" => (native_parse_uint, 1),
        "parseFloat" => (native_parse_float, 1),
        "abs" => (native_abs, 1),
        "floor" => (native_floor, 1),
        "ceil" => (native_ceil, 1),
        "pow" => (native_pow, 2),
        // `Set` is variadic and constructs a heap object directly; the VM's
        // CALL handling special-cases it rather than routing through a
        // plain native-function slot (see vm.rs).
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqrt_computes_correctly() {
        let result = native_sqrt(&[Value::Number(16.0)]).unwrap();
        assert_eq!(result, Value::Number(4.0));
    }

    #[test]
    fn len_rejects_unsupported_values() {
        assert!(native_len(&[Value::Nil]).is_err());
    }

    #[test]
    fn error_always_fails() {
        assert!(native_error(&[Value::str("boom")]).is_err());
    }

    #[test]
    fn parse_int_rejects_non_numeric_text() {
        assert!(native_parse_int(&[Value::str("not a number")]).is_err());
        assert_eq!(native_parse_int(&[Value::str("42")]).unwrap(), Value::Number(42.0));
    }

    #[test]
    fn descriptor_list_matches_documented_stdlib() {
        let names: Vec<&str> = standard_library_natives().iter().map(|d| d.name).collect();
        assert_eq!(
            names,
            vec![
                "clock", "sqrt", "len", "error", "num", "type", "str", "toString", "parseInt",
                "parseUInt", "parseFloat", "abs", "floor", "ceil", "pow", "Set",
            ]
        );
    }
}
