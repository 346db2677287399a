//! Allowlisted import modules for the sandbox.
//!
//! Scripts may only `import` the module names in [`ALLOWED_MODULES`]; the
//! resolver below serves each of them as a native rhai [`Module`]. Anything
//! else is rejected before execution with an error naming the allowlist.

use regex::Regex;
use rhai::module_resolvers::StaticModuleResolver;
use rhai::{Array, Dynamic, EvalAltResult, FnPtr, Map, Module, NativeCallContext, Position, INT};

/// Module names scripts are allowed to import.
pub const ALLOWED_MODULES: [&str; 7] = [
    "re",
    "json",
    "math",
    "string",
    "collections",
    "functools",
    "itertools",
];

type FnResult<T> = Result<T, Box<EvalAltResult>>;

fn runtime_error(message: impl Into<String>) -> Box<EvalAltResult> {
    EvalAltResult::ErrorRuntime(Dynamic::from(message.into()), Position::NONE).into()
}

fn compile_pattern(pattern: &str) -> FnResult<Regex> {
    Regex::new(pattern).map_err(|e| runtime_error(format!("invalid pattern: {}", e)))
}

/// Build a module resolver serving exactly the allowlisted modules.
pub fn resolver() -> StaticModuleResolver {
    let mut resolver = StaticModuleResolver::new();
    resolver.insert("re", re_module());
    resolver.insert("json", json_module());
    resolver.insert("math", math_module());
    resolver.insert("string", string_module());
    resolver.insert("collections", collections_module());
    resolver.insert("functools", functools_module());
    resolver.insert("itertools", itertools_module());
    resolver
}

fn re_module() -> Module {
    let mut module = Module::new();

    module.set_native_fn("is_match", |text: &str, pattern: &str| -> FnResult<bool> {
        Ok(compile_pattern(pattern)?.is_match(text))
    });

    module.set_native_fn("find", |text: &str, pattern: &str| -> FnResult<String> {
        let re = compile_pattern(pattern)?;
        Ok(re
            .find(text)
            .map(|m| m.as_str().to_string())
            .unwrap_or_default())
    });

    module.set_native_fn("find_all", |text: &str, pattern: &str| -> FnResult<Array> {
        let re = compile_pattern(pattern)?;
        Ok(re
            .find_iter(text)
            .map(|m| Dynamic::from(m.as_str().to_string()))
            .collect())
    });

    module.set_native_fn(
        "replace",
        |text: &str, pattern: &str, replacement: &str| -> FnResult<String> {
            let re = compile_pattern(pattern)?;
            Ok(re.replace_all(text, replacement).into_owned())
        },
    );

    module.set_native_fn("split", |text: &str, pattern: &str| -> FnResult<Array> {
        let re = compile_pattern(pattern)?;
        Ok(re
            .split(text)
            .map(|part| Dynamic::from(part.to_string()))
            .collect())
    });

    module
}

fn json_module() -> Module {
    let mut module = Module::new();

    module.set_native_fn("parse", |text: &str| -> FnResult<Dynamic> {
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| runtime_error(format!("invalid json: {}", e)))?;
        rhai::serde::to_dynamic(value)
    });

    module.set_native_fn("dump", |value: Dynamic| -> FnResult<String> {
        let json: serde_json::Value = rhai::serde::from_dynamic(&value)?;
        Ok(json.to_string())
    });

    module
}

fn math_module() -> Module {
    let mut module = Module::new();

    module.set_var("pi", std::f64::consts::PI);
    module.set_var("e", std::f64::consts::E);

    module.set_native_fn("sqrt", |x: f64| -> FnResult<f64> { Ok(x.sqrt()) });
    module.set_native_fn("ln", |x: f64| -> FnResult<f64> { Ok(x.ln()) });
    module.set_native_fn("log10", |x: f64| -> FnResult<f64> { Ok(x.log10()) });
    module.set_native_fn("exp", |x: f64| -> FnResult<f64> { Ok(x.exp()) });
    module.set_native_fn("pow", |x: f64, y: f64| -> FnResult<f64> { Ok(x.powf(y)) });
    module.set_native_fn("floor", |x: f64| -> FnResult<f64> { Ok(x.floor()) });
    module.set_native_fn("ceil", |x: f64| -> FnResult<f64> { Ok(x.ceil()) });
    module.set_native_fn("abs", |x: f64| -> FnResult<f64> { Ok(x.abs()) });

    module
}

fn string_module() -> Module {
    let mut module = Module::new();

    module.set_var("ascii_lowercase", "abcdefghijklmnopqrstuvwxyz".to_string());
    module.set_var("ascii_uppercase", "ABCDEFGHIJKLMNOPQRSTUVWXYZ".to_string());
    module.set_var("digits", "0123456789".to_string());
    module.set_var("punctuation", "!\"#$%&'()*+,-./:;<=>?@[\\]^_`{|}~".to_string());
    module.set_var("whitespace", " \t\n\r".to_string());

    module.set_native_fn("upper", |s: &str| -> FnResult<String> { Ok(s.to_uppercase()) });
    module.set_native_fn("lower", |s: &str| -> FnResult<String> { Ok(s.to_lowercase()) });
    module.set_native_fn("strip", |s: &str| -> FnResult<String> { Ok(s.trim().to_string()) });

    module
}

fn collections_module() -> Module {
    let mut module = Module::new();

    module.set_native_fn("counter", |items: Array| -> FnResult<Map> {
        let mut counts = Map::new();
        for item in items {
            let key = item.to_string();
            let entry = counts.entry(key.into()).or_insert_with(|| Dynamic::from(0 as INT));
            if let Ok(current) = entry.as_int() {
                *entry = Dynamic::from(current + 1);
            }
        }
        Ok(counts)
    });

    module.set_native_fn("most_common", |counts: Map, n: INT| -> FnResult<Array> {
        let mut entries: Vec<(String, INT)> = counts
            .into_iter()
            .map(|(key, value)| (key.to_string(), value.as_int().unwrap_or(0)))
            .collect();
        // Descending by count, ascending by key for a stable ordering
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        entries.truncate(n.max(0) as usize);
        Ok(entries
            .into_iter()
            .map(|(key, count)| {
                Dynamic::from(vec![Dynamic::from(key), Dynamic::from(count)] as Array)
            })
            .collect())
    });

    module
}

fn functools_module() -> Module {
    let mut module = Module::new();

    module.set_native_fn(
        "reduce",
        |ctx: NativeCallContext, f: FnPtr, items: Array, init: Dynamic| -> FnResult<Dynamic> {
            let mut acc = init;
            for item in items {
                acc = f.call_within_context(&ctx, (acc, item))?;
            }
            Ok(acc)
        },
    );

    module
}

fn itertools_module() -> Module {
    let mut module = Module::new();

    module.set_native_fn("enumerate", |items: Array| -> FnResult<Array> {
        Ok(items
            .into_iter()
            .enumerate()
            .map(|(i, item)| Dynamic::from(vec![Dynamic::from(i as INT), item] as Array))
            .collect())
    });

    module.set_native_fn("zip", |a: Array, b: Array| -> FnResult<Array> {
        Ok(a.into_iter()
            .zip(b)
            .map(|(x, y)| Dynamic::from(vec![x, y] as Array))
            .collect())
    });

    module.set_native_fn("chunked", |items: Array, size: INT| -> FnResult<Array> {
        if size <= 0 {
            return Err(runtime_error("chunk size must be positive"));
        }
        Ok(items
            .chunks(size as usize)
            .map(|chunk| Dynamic::from(chunk.to_vec() as Array))
            .collect())
    });

    module
}

#[cfg(test)]
mod tests {
    use super::*;
    use rhai::Engine;

    fn engine() -> Engine {
        let mut engine = Engine::new();
        engine.set_module_resolver(resolver());
        engine
    }

    #[test]
    fn test_re_module_find_all() {
        let result: Array = engine()
            .eval(r#"import "re" as re; re::find_all("a1 b2 c3", "[a-z][0-9]")"#)
            .unwrap();
        assert_eq!(result.len(), 3);
        assert_eq!(result[0].to_string(), "a1");
    }

    #[test]
    fn test_re_module_invalid_pattern_is_runtime_error() {
        let result = engine().eval::<bool>(r#"import "re" as re; re::is_match("x", "[")"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_json_roundtrip() {
        let result: String = engine()
            .eval(r#"import "json" as json; json::dump(json::parse("{\"a\": 1}"))"#)
            .unwrap();
        assert_eq!(result, "{\"a\":1}");
    }

    #[test]
    fn test_counter_and_most_common() {
        let result: Array = engine()
            .eval(
                r#"
                import "collections" as collections;
                let counts = collections::counter(["a", "b", "a", "a", "b", "c"]);
                collections::most_common(counts, 2)
                "#,
            )
            .unwrap();
        assert_eq!(result.len(), 2);
        let first = result[0].clone().into_array().unwrap();
        assert_eq!(first[0].to_string(), "a");
        assert_eq!(first[1].as_int().unwrap(), 3);
    }

    #[test]
    fn test_functools_reduce() {
        let result: i64 = engine()
            .eval(
                r#"
                import "functools" as functools;
                functools::reduce(|acc, x| acc + x, [1, 2, 3, 4], 0)
                "#,
            )
            .unwrap();
        assert_eq!(result, 10);
    }

    #[test]
    fn test_itertools_enumerate() {
        let result: Array = engine()
            .eval(r#"import "itertools" as itertools; itertools::enumerate(["x", "y"])"#)
            .unwrap();
        let first = result[0].clone().into_array().unwrap();
        assert_eq!(first[0].as_int().unwrap(), 0);
        assert_eq!(first[1].to_string(), "x");
    }

    #[test]
    fn test_unlisted_module_fails_to_resolve() {
        let result = engine().run(r#"import "os" as os;"#);
        assert!(result.is_err());
    }
}
