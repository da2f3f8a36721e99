use dx_lang::AstNode;
use dx_value::{Value, format_number};

use crate::{ColumnEvaluator, date};

/// Every builtin the formula language exposes. The pipeline rejects calls
/// outside this set at validation time; the evaluator degrades them to null.
const BUILTINS: [&str; 33] = [
    "row_mean",
    "row_sum",
    "row_min",
    "row_max",
    "row_sd",
    "row_count_null",
    "row_count_valid",
    "if_else",
    "case",
    "coalesce",
    "is_null",
    "fill_null",
    "null_if",
    "in",
    "between",
    "lower",
    "upper",
    "trim",
    "concat",
    "str_contains",
    "str_replace",
    "str_length",
    "date_diff",
    "date_part",
    "date_floor",
    "recode",
    "cut",
    "round",
    "zscore",
    "col_mean",
    "col_min",
    "col_max",
    "percentile_rank",
];

#[must_use]
pub fn is_builtin(name: &str) -> bool {
    BUILTINS.contains(&name)
}

pub(crate) fn call(
    ev: &mut ColumnEvaluator<'_>,
    name: &str,
    args: &[AstNode],
    row: usize,
) -> Value {
    match name {
        "row_mean" => row_aggregate(ev, args, row, RowAgg::Mean),
        "row_sum" => row_aggregate(ev, args, row, RowAgg::Sum),
        "row_min" => row_aggregate(ev, args, row, RowAgg::Min),
        "row_max" => row_aggregate(ev, args, row, RowAgg::Max),
        "row_sd" => row_aggregate(ev, args, row, RowAgg::Sd),
        "row_count_null" => {
            let nulls = args
                .iter()
                .filter(|arg| ev.evaluate_at(arg, row).is_null())
                .count();
            Value::Number(nulls as f64)
        }
        "row_count_valid" => {
            let valid = args
                .iter()
                .filter(|arg| !ev.evaluate_at(arg, row).is_null())
                .count();
            Value::Number(valid as f64)
        }
        "if_else" => {
            let [cond, when_true, when_false] = args else {
                return Value::Null;
            };
            // Anything non-true, null included, takes the false branch.
            if ev.evaluate_at(cond, row).is_truthy() {
                ev.evaluate_at(when_true, row)
            } else {
                ev.evaluate_at(when_false, row)
            }
        }
        "case" => {
            let mut i = 0;
            while i + 1 < args.len() {
                if ev.evaluate_at(&args[i], row).is_truthy() {
                    return ev.evaluate_at(&args[i + 1], row);
                }
                i += 2;
            }
            // An odd trailing argument is the default.
            if args.len() % 2 == 1 {
                return ev.evaluate_at(&args[args.len() - 1], row);
            }
            Value::Null
        }
        "coalesce" => {
            for arg in args {
                let value = ev.evaluate_at(arg, row);
                if !value.is_null() {
                    return value;
                }
            }
            Value::Null
        }
        "is_null" => {
            let [arg] = args else { return Value::Null };
            Value::Bool(ev.evaluate_at(arg, row).is_null())
        }
        "fill_null" => {
            let [arg, default] = args else {
                return Value::Null;
            };
            let value = ev.evaluate_at(arg, row);
            if value.is_null() {
                ev.evaluate_at(default, row)
            } else {
                value
            }
        }
        "null_if" => {
            let [arg, sentinel] = args else {
                return Value::Null;
            };
            let value = ev.evaluate_at(arg, row);
            let sentinel = ev.evaluate_at(sentinel, row);
            if value.strict_eq(&sentinel) {
                Value::Null
            } else {
                value
            }
        }
        "in" => {
            let Some((target, candidates)) = args.split_first() else {
                return Value::Null;
            };
            let value = ev.evaluate_at(target, row);
            if value.is_null() {
                return Value::Bool(false);
            }
            let found = candidates
                .iter()
                .any(|c| ev.evaluate_at(c, row).strict_eq(&value));
            Value::Bool(found)
        }
        "between" => {
            let [target, lo, hi] = args else {
                return Value::Null;
            };
            let value = ev.evaluate_at(target, row);
            let lo = ev.evaluate_at(lo, row);
            let hi = ev.evaluate_at(hi, row);
            match (value.compare_order(&lo), value.compare_order(&hi)) {
                // Inclusive on both ends.
                (Some(low), Some(high)) => Value::Bool(low.is_ge() && high.is_le()),
                _ => Value::Null,
            }
        }
        "lower" => map_text(ev, args, row, |s| s.to_lowercase()),
        "upper" => map_text(ev, args, row, |s| s.to_uppercase()),
        "trim" => map_text(ev, args, row, |s| s.trim().to_owned()),
        "concat" => {
            // Null arguments concatenate as empty text, not as null.
            let mut out = String::new();
            for arg in args {
                if let Some(text) = ev.evaluate_at(arg, row).as_text() {
                    out.push_str(&text);
                }
            }
            Value::Utf8(out)
        }
        "str_contains" => {
            let [target, needle] = args else {
                return Value::Null;
            };
            let (Some(target), Some(needle)) = (
                ev.evaluate_at(target, row).as_text(),
                ev.evaluate_at(needle, row).as_text(),
            ) else {
                return Value::Null;
            };
            Value::Bool(target.contains(&needle))
        }
        "str_replace" => {
            let [target, from, to] = args else {
                return Value::Null;
            };
            let (Some(target), Some(from), Some(to)) = (
                ev.evaluate_at(target, row).as_text(),
                ev.evaluate_at(from, row).as_text(),
                ev.evaluate_at(to, row).as_text(),
            ) else {
                return Value::Null;
            };
            Value::Utf8(target.replace(&from, &to))
        }
        "str_length" => {
            let [arg] = args else { return Value::Null };
            match ev.evaluate_at(arg, row).as_text() {
                // An empty CSV cell denotes missing data, not zero length.
                Some(text) if text.is_empty() => Value::Null,
                Some(text) => Value::Number(text.chars().count() as f64),
                None => Value::Null,
            }
        }
        "date_diff" => {
            let [a, b, unit] = args else { return Value::Null };
            let (Some(a), Some(b)) = (
                date::parse_date(&ev.evaluate_at(a, row)),
                date::parse_date(&ev.evaluate_at(b, row)),
            ) else {
                return Value::Null;
            };
            let Some(unit) = ev.evaluate_at(unit, row).as_text() else {
                return Value::Null;
            };
            let delta = match unit.as_str() {
                "days" => date::diff_days(a, b),
                "months" => date::diff_months(a, b),
                "years" => date::diff_years(a, b),
                _ => return Value::Null,
            };
            Value::Number(delta as f64)
        }
        "date_part" => {
            let [target, part] = args else { return Value::Null };
            let Some(parsed) = date::parse_date(&ev.evaluate_at(target, row)) else {
                return Value::Null;
            };
            let Some(part) = ev.evaluate_at(part, row).as_text() else {
                return Value::Null;
            };
            match date::part(parsed, &part) {
                Some(n) => Value::Number(n),
                None => Value::Null,
            }
        }
        "date_floor" => {
            let [target, unit] = args else { return Value::Null };
            let Some(parsed) = date::parse_date(&ev.evaluate_at(target, row)) else {
                return Value::Null;
            };
            let Some(unit) = ev.evaluate_at(unit, row).as_text() else {
                return Value::Null;
            };
            match date::floor(parsed, &unit) {
                Some(floored) => Value::Utf8(date::render(floored)),
                None => Value::Null,
            }
        }
        "recode" => {
            let Some((target, rest)) = args.split_first() else {
                return Value::Null;
            };
            let value = ev.evaluate_at(target, row);
            let mut i = 0;
            while i + 1 < rest.len() {
                let key = ev.evaluate_at(&rest[i], row);
                if value.strict_eq(&key) {
                    return ev.evaluate_at(&rest[i + 1], row);
                }
                i += 2;
            }
            if rest.len() % 2 == 1 {
                return ev.evaluate_at(&rest[rest.len() - 1], row);
            }
            Value::Null
        }
        "cut" => cut(ev, args, row),
        "round" => {
            if args.is_empty() || args.len() > 2 {
                return Value::Null;
            }
            let Some(x) = ev.evaluate_at(&args[0], row).as_number() else {
                return Value::Null;
            };
            let decimals = match args.get(1) {
                Some(arg) => match ev.evaluate_at(arg, row).as_number() {
                    Some(d) => d.trunc(),
                    None => return Value::Null,
                },
                None => 0.0,
            };
            let factor = 10f64.powi(decimals.clamp(-12.0, 12.0) as i32);
            Value::from_finite((x * factor).round() / factor)
        }
        "zscore" | "col_mean" | "col_min" | "col_max" | "percentile_rank" => {
            window(ev, name, args, row)
        }
        _ => Value::Null,
    }
}

enum RowAgg {
    Mean,
    Sum,
    Min,
    Max,
    Sd,
}

/// Null-skipping aggregate across the named arguments of a single row.
/// All-null input yields null; `row_sd` is the population form with a
/// single observation giving 0.
fn row_aggregate(ev: &mut ColumnEvaluator<'_>, args: &[AstNode], row: usize, agg: RowAgg) -> Value {
    let nums: Vec<f64> = args
        .iter()
        .filter_map(|arg| ev.evaluate_at(arg, row).as_number())
        .collect();
    if nums.is_empty() {
        return Value::Null;
    }
    let n = nums.len() as f64;
    let out = match agg {
        RowAgg::Sum => nums.iter().sum(),
        RowAgg::Mean => nums.iter().sum::<f64>() / n,
        RowAgg::Min => nums.iter().copied().fold(f64::INFINITY, f64::min),
        RowAgg::Max => nums.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        RowAgg::Sd => {
            let mean = nums.iter().sum::<f64>() / n;
            let var = nums.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
            var.sqrt()
        }
    };
    Value::from_finite(out)
}

fn map_text(
    ev: &mut ColumnEvaluator<'_>,
    args: &[AstNode],
    row: usize,
    f: impl Fn(&str) -> String,
) -> Value {
    let [arg] = args else { return Value::Null };
    match ev.evaluate_at(arg, row).as_text() {
        Some(text) => Value::Utf8(f(&text)),
        None => Value::Null,
    }
}

/// Bin a value into `breaks.len() - 1` intervals, each inclusive of its
/// lower bound and exclusive of its upper bound, except the final bin which
/// also includes the top break. Values strictly outside the break range
/// yield null. Omitted labels auto-generate as `"<lo>-<hi>"`.
fn cut(ev: &mut ColumnEvaluator<'_>, args: &[AstNode], row: usize) -> Value {
    if args.len() < 2 || args.len() > 3 {
        return Value::Null;
    }
    let Some(x) = ev.evaluate_at(&args[0], row).as_number() else {
        return Value::Null;
    };
    let Some(break_values) = ev.eval_array(&args[1], row) else {
        return Value::Null;
    };
    let breaks: Option<Vec<f64>> = break_values.iter().map(Value::as_number).collect();
    let Some(breaks) = breaks else {
        return Value::Null;
    };
    if breaks.len() < 2 {
        return Value::Null;
    }

    let labels: Option<Vec<String>> = match args.get(2) {
        Some(node) => {
            let Some(values) = ev.eval_array(node, row) else {
                return Value::Null;
            };
            values.iter().map(Value::as_text).collect()
        }
        None => None,
    };

    let bins = breaks.len() - 1;
    if x < breaks[0] || x > breaks[bins] {
        return Value::Null;
    }
    for i in 0..bins {
        let top_bin = i == bins - 1;
        let hit = if top_bin {
            x >= breaks[i] && x <= breaks[i + 1]
        } else {
            x >= breaks[i] && x < breaks[i + 1]
        };
        if hit {
            let label = match &labels {
                Some(labels) if labels.len() == bins => labels[i].clone(),
                _ => format!("{}-{}", format_number(breaks[i]), format_number(breaks[i + 1])),
            };
            return Value::Utf8(label);
        }
    }
    Value::Null
}

enum WindowFn {
    Zscore,
    Mean,
    Min,
    Max,
    PercentileRank,
}

/// Window/statistical functions aggregate over the evaluator's row scope
/// (the current partition), never over a single row.
fn window(ev: &mut ColumnEvaluator<'_>, name: &str, args: &[AstNode], row: usize) -> Value {
    let which = match name {
        "zscore" => WindowFn::Zscore,
        "col_mean" => WindowFn::Mean,
        "col_min" => WindowFn::Min,
        "col_max" => WindowFn::Max,
        "percentile_rank" => WindowFn::PercentileRank,
        _ => return Value::Null,
    };
    let [arg] = args else { return Value::Null };

    let x = ev.evaluate_at(arg, row).as_number();
    let key = ev.ensure_window(arg);
    let stats = ev.window_stats(&key);

    match which {
        WindowFn::Mean => {
            if stats.len() == 0 {
                Value::Null
            } else {
                Value::Number(stats.mean)
            }
        }
        WindowFn::Min => stats.sorted.first().copied().map_or(Value::Null, Value::Number),
        WindowFn::Max => stats.sorted.last().copied().map_or(Value::Null, Value::Number),
        WindowFn::Zscore => {
            let Some(x) = x else { return Value::Null };
            if stats.len() == 0 || stats.sd == 0.0 {
                return Value::Null;
            }
            Value::Number((x - stats.mean) / stats.sd)
        }
        WindowFn::PercentileRank => {
            let Some(x) = x else { return Value::Null };
            let n = stats.len();
            if n <= 1 {
                return Value::Number(0.0);
            }
            // Fraction of values strictly below x; ties share the same
            // fraction. Binary search over the sorted copy, equivalent to a
            // linear scan.
            let below = stats.sorted.partition_point(|v| *v < x);
            Value::Number(below as f64 / (n - 1) as f64)
        }
    }
}
