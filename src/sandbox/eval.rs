// =============================================================================
// Strategy language evaluator
// =============================================================================
//
// Tree-walking interpreter over the validated AST. Two independent bounds
// apply to every run:
//
//   * fuel  -- a step budget decremented on every node visit, so a runaway
//     loop dies even if the watchdog never fires;
//   * cancel -- an atomic flag flipped by the deadline watchdog, checked on
//     every step, so a cancelled run returns within a handful of node visits.
//
// Indicator calls with insufficient lookback produce `Nil`. Nil propagates
// through arithmetic and makes comparisons false, so a strategy over a young
// series simply does not match instead of erroring.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::indicators;
use crate::types::MarketView;

use super::parser::{BinOp, Expr, Program, Stmt, UnOp};

/// Default step budget per evaluation.
pub const DEFAULT_FUEL: u64 = 5_000_000;

/// Runtime value. `Nil` is the insufficient-data sentinel.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Num(f64),
    Bool(bool),
    Str(String),
    Nil,
}

impl Value {
    fn from_opt(v: Option<f64>) -> Self {
        match v {
            Some(x) if x.is_finite() => Value::Num(x),
            _ => Value::Nil,
        }
    }
}

/// Why an evaluation stopped abnormally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalError {
    /// The cancel flag was observed set.
    Cancelled,
    /// The fuel budget ran out.
    OutOfFuel,
    /// A genuine runtime fault (type error, unknown timeframe, ...).
    Runtime(String),
}

impl std::fmt::Display for EvalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancelled => write!(f, "evaluation cancelled"),
            Self::OutOfFuel => write!(f, "evaluation exceeded its step budget"),
            Self::Runtime(msg) => write!(f, "{msg}"),
        }
    }
}

enum Flow {
    Normal,
    Break,
    Return(Value),
}

struct Interp<'a> {
    view: &'a MarketView,
    cancel: &'a AtomicBool,
    fuel: u64,
    locals: HashMap<String, Value>,
}

/// Run a validated program against one market view.
///
/// The program's `return` value decides the match: `true` matches, `false`
/// and `Nil` do not. Falling off the end without a `return` is "no match".
pub fn run(
    program: &Program,
    view: &MarketView,
    cancel: &AtomicBool,
    fuel: u64,
) -> Result<bool, EvalError> {
    let mut interp = Interp {
        view,
        cancel,
        fuel,
        locals: HashMap::new(),
    };
    match interp.exec_block(&program.body)? {
        Flow::Return(Value::Bool(b)) => Ok(b),
        Flow::Return(Value::Nil) => Ok(false),
        Flow::Return(other) => Err(EvalError::Runtime(format!(
            "strategy must return a boolean, got {other:?}"
        ))),
        _ => Ok(false),
    }
}

impl<'a> Interp<'a> {
    fn step(&mut self) -> Result<(), EvalError> {
        if self.fuel == 0 {
            return Err(EvalError::OutOfFuel);
        }
        self.fuel -= 1;
        // The flag is only flipped once per run, so a relaxed read suffices.
        if self.fuel % 64 == 0 && self.cancel.load(Ordering::Relaxed) {
            return Err(EvalError::Cancelled);
        }
        Ok(())
    }

    fn exec_block(&mut self, block: &[Stmt]) -> Result<Flow, EvalError> {
        for stmt in block {
            match self.exec_stmt(stmt)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&mut self, stmt: &Stmt) -> Result<Flow, EvalError> {
        self.step()?;
        match stmt {
            Stmt::Declare(name, expr) | Stmt::Assign { name, expr, .. } => {
                let v = self.eval(expr)?;
                self.locals.insert(name.clone(), v);
                Ok(Flow::Normal)
            }
            Stmt::If {
                cond,
                then_block,
                else_block,
            } => {
                if self.truthy(cond)? {
                    self.exec_block(then_block)
                } else if let Some(eb) = else_block {
                    self.exec_block(eb)
                } else {
                    Ok(Flow::Normal)
                }
            }
            Stmt::For { cond, body } => {
                loop {
                    self.step()?;
                    if let Some(c) = cond {
                        if !self.truthy(c)? {
                            break;
                        }
                    }
                    match self.exec_block(body)? {
                        Flow::Normal => {}
                        Flow::Break => break,
                        ret @ Flow::Return(_) => return Ok(ret),
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::Return(expr) => {
                let v = self.eval(expr)?;
                Ok(Flow::Return(v))
            }
            Stmt::Break { .. } => Ok(Flow::Break),
        }
    }

    /// Condition evaluation: booleans decide; Nil is false.
    fn truthy(&mut self, cond: &Expr) -> Result<bool, EvalError> {
        match self.eval(cond)? {
            Value::Bool(b) => Ok(b),
            Value::Nil => Ok(false),
            other => Err(EvalError::Runtime(format!(
                "condition must be a boolean, got {other:?}"
            ))),
        }
    }

    fn eval(&mut self, expr: &Expr) -> Result<Value, EvalError> {
        self.step()?;
        match expr {
            Expr::Num(n) => Ok(Value::Num(*n)),
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Var { name, .. } => self
                .locals
                .get(name)
                .cloned()
                .ok_or_else(|| EvalError::Runtime(format!("unbound variable '{name}'"))),
            Expr::Unary(op, inner) => {
                let v = self.eval(inner)?;
                match (op, v) {
                    (UnOp::Neg, Value::Num(n)) => Ok(Value::Num(-n)),
                    (UnOp::Neg, Value::Nil) => Ok(Value::Nil),
                    (UnOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
                    (UnOp::Not, Value::Nil) => Ok(Value::Bool(true)),
                    (op, v) => Err(EvalError::Runtime(format!(
                        "invalid operand {v:?} for unary {op:?}"
                    ))),
                }
            }
            Expr::Binary(op, lhs, rhs) => self.eval_binary(*op, lhs, rhs),
            Expr::Call { name, args, .. } => self.call(name, args),
        }
    }

    fn eval_binary(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr) -> Result<Value, EvalError> {
        // Short-circuit boolean operators first.
        if op == BinOp::And {
            return Ok(Value::Bool(self.truthy(lhs)? && self.truthy(rhs)?));
        }
        if op == BinOp::Or {
            return Ok(Value::Bool(self.truthy(lhs)? || self.truthy(rhs)?));
        }

        let l = self.eval(lhs)?;
        let r = self.eval(rhs)?;

        // Nil propagation: arithmetic stays Nil, comparisons are false.
        let any_nil = l == Value::Nil || r == Value::Nil;
        match op {
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Rem if any_nil => {
                Ok(Value::Nil)
            }
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge if any_nil => {
                Ok(Value::Bool(false))
            }
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Rem => {
                let (a, b) = num_pair(&l, &r)?;
                let out = match op {
                    BinOp::Add => a + b,
                    BinOp::Sub => a - b,
                    BinOp::Mul => a * b,
                    BinOp::Div => {
                        if b == 0.0 {
                            return Ok(Value::Nil);
                        }
                        a / b
                    }
                    BinOp::Rem => {
                        if b == 0.0 {
                            return Ok(Value::Nil);
                        }
                        a % b
                    }
                    _ => unreachable!(),
                };
                Ok(Value::from_opt(Some(out)))
            }
            BinOp::Eq => Ok(Value::Bool(values_eq(&l, &r))),
            BinOp::Ne => Ok(Value::Bool(!values_eq(&l, &r))),
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                let (a, b) = num_pair(&l, &r)?;
                let out = match op {
                    BinOp::Lt => a < b,
                    BinOp::Le => a <= b,
                    BinOp::Gt => a > b,
                    BinOp::Ge => a >= b,
                    _ => unreachable!(),
                };
                Ok(Value::Bool(out))
            }
            BinOp::And | BinOp::Or => unreachable!(),
        }
    }

    // --- host surface -----------------------------------------------------

    fn call(&mut self, name: &str, args: &[Expr]) -> Result<Value, EvalError> {
        let mut vals = Vec::with_capacity(args.len());
        for a in args {
            vals.push(self.eval(a)?);
        }

        match name {
            "price" => Ok(Value::Num(self.view.ticker.last_price)),
            "change24h" => Ok(Value::Num(self.view.ticker.change_pct_24h)),
            "volume24h" => Ok(Value::Num(self.view.ticker.quote_volume_24h)),
            "symbol" => Ok(Value::Str(self.view.symbol.clone())),
            "close_time" => Ok(Value::Num(self.view.close_time as f64)),

            "open" | "high" | "low" | "close" | "volume" => {
                let tf = as_str(&vals[0], name)?;
                let ago = as_index(&vals[1], name)?;
                let series = self.series(&tf)?;
                if ago >= series.len() {
                    return Ok(Value::Nil);
                }
                let candle = &series[series.len() - 1 - ago];
                let v = match name {
                    "open" => candle.open,
                    "high" => candle.high,
                    "low" => candle.low,
                    "close" => candle.close,
                    _ => candle.volume,
                };
                Ok(Value::Num(v))
            }
            "candle_count" => {
                let tf = as_str(&vals[0], name)?;
                Ok(Value::Num(self.series(&tf)?.len() as f64))
            }

            "sma" | "ema" | "rsi" => {
                let tf = as_str(&vals[0], name)?;
                let n = as_index(&vals[1], name)?;
                let closes = indicators::closes(self.series(&tf)?);
                let out = match name {
                    "sma" => indicators::sma(&closes, n),
                    "ema" => indicators::ema(&closes, n),
                    _ => indicators::rsi(&closes, n),
                };
                Ok(Value::from_opt(out))
            }
            "macd" | "macd_signal" | "macd_hist" => {
                let tf = as_str(&vals[0], name)?;
                let fast = as_index(&vals[1], name)?;
                let slow = as_index(&vals[2], name)?;
                let sig = as_index(&vals[3], name)?;
                let closes = indicators::closes(self.series(&tf)?);
                let out = indicators::macd(&closes, fast, slow, sig).map(|m| match name {
                    "macd" => m.macd,
                    "macd_signal" => m.signal,
                    _ => m.histogram,
                });
                Ok(Value::from_opt(out))
            }
            "bollinger_upper" | "bollinger_middle" | "bollinger_lower" => {
                let tf = as_str(&vals[0], name)?;
                let n = as_index(&vals[1], name)?;
                let k = as_num(&vals[2], name)?;
                let closes = indicators::closes(self.series(&tf)?);
                let out = indicators::bollinger(&closes, n, k).map(|b| match name {
                    "bollinger_upper" => b.upper,
                    "bollinger_middle" => b.middle,
                    _ => b.lower,
                });
                Ok(Value::from_opt(out))
            }
            "atr" => {
                let tf = as_str(&vals[0], name)?;
                let n = as_index(&vals[1], name)?;
                Ok(Value::from_opt(indicators::atr(self.series(&tf)?, n)))
            }
            "vwap" => {
                let tf = as_str(&vals[0], name)?;
                Ok(Value::from_opt(indicators::vwap(self.series(&tf)?)))
            }
            "stoch_k" | "stoch_d" => {
                let tf = as_str(&vals[0], name)?;
                let k = as_index(&vals[1], name)?;
                let d = as_index(&vals[2], name)?;
                let out = indicators::stochastic(self.series(&tf)?, k, d)
                    .map(|s| if name == "stoch_k" { s.k } else { s.d });
                Ok(Value::from_opt(out))
            }
            "highest" | "lowest" | "avg_volume" => {
                let tf = as_str(&vals[0], name)?;
                let n = as_index(&vals[1], name)?;
                let series = self.series(&tf)?;
                let out = match name {
                    "highest" => indicators::highest_high(series, n),
                    "lowest" => indicators::lowest_low(series, n),
                    _ => indicators::avg_volume(series, n),
                };
                Ok(Value::from_opt(out))
            }
            "engulfing" => {
                let tf = as_str(&vals[0], name)?;
                let pattern = indicators::engulfing(self.series(&tf)?);
                Ok(Value::Str(pattern.to_string()))
            }

            "abs" => Ok(map_num(&vals[0], f64::abs)),
            "floor" => Ok(map_num(&vals[0], f64::floor)),
            "ceil" => Ok(map_num(&vals[0], f64::ceil)),
            "round" => Ok(map_num(&vals[0], f64::round)),
            "min" | "max" => match (&vals[0], &vals[1]) {
                (Value::Num(a), Value::Num(b)) => Ok(Value::Num(if name == "min" {
                    a.min(*b)
                } else {
                    a.max(*b)
                })),
                _ => Ok(Value::Nil),
            },

            // Unreachable: the validator resolved the name at compile time.
            other => Err(EvalError::Runtime(format!("unknown function '{other}'"))),
        }
    }

    fn series(&self, tf: &str) -> Result<&'a [crate::types::Candle], EvalError> {
        if self.view.candles.contains_key(tf) {
            Ok(self.view.series(tf))
        } else {
            Err(EvalError::Runtime(format!(
                "timeframe '{tf}' is not part of this strategy's configuration"
            )))
        }
    }
}

fn values_eq(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Num(a), Value::Num(b)) => a == b,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Str(a), Value::Str(b)) => a == b,
        _ => false,
    }
}

fn num_pair(l: &Value, r: &Value) -> Result<(f64, f64), EvalError> {
    match (l, r) {
        (Value::Num(a), Value::Num(b)) => Ok((*a, *b)),
        _ => Err(EvalError::Runtime(format!(
            "numeric operation on non-numeric values {l:?} and {r:?}"
        ))),
    }
}

fn map_num(v: &Value, f: impl Fn(f64) -> f64) -> Value {
    match v {
        Value::Num(n) => Value::from_opt(Some(f(*n))),
        _ => Value::Nil,
    }
}

fn as_str(v: &Value, fun: &str) -> Result<String, EvalError> {
    match v {
        Value::Str(s) => Ok(s.clone()),
        other => Err(EvalError::Runtime(format!(
            "function '{fun}' expects a timeframe string, got {other:?}"
        ))),
    }
}

fn as_num(v: &Value, fun: &str) -> Result<f64, EvalError> {
    match v {
        Value::Num(n) => Ok(*n),
        other => Err(EvalError::Runtime(format!(
            "function '{fun}' expects a number, got {other:?}"
        ))),
    }
}

fn as_index(v: &Value, fun: &str) -> Result<usize, EvalError> {
    let n = as_num(v, fun)?;
    if n < 0.0 || n.fract() != 0.0 || n > u32::MAX as f64 {
        return Err(EvalError::Runtime(format!(
            "function '{fun}' expects a small non-negative integer, got {n}"
        )));
    }
    Ok(n as usize)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::parser::compile;
    use crate::types::{Candle, Ticker};

    fn view_with_closes(closes: &[f64]) -> MarketView {
        let candles: Vec<Candle> = closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Candle {
                open_time: i as i64 * 60_000,
                close_time: i as i64 * 60_000 + 59_999,
                open: c,
                high: c + 1.0,
                low: c - 1.0,
                close: c,
                volume: 10.0,
                quote_volume: 100.0,
                is_closed: true,
            })
            .collect();
        let mut map = std::collections::HashMap::new();
        map.insert("1m".to_string(), candles);
        MarketView {
            symbol: "BTCUSDT".into(),
            ticker: Ticker {
                symbol: "BTCUSDT".into(),
                last_price: *closes.last().unwrap_or(&0.0),
                change_pct_24h: 2.5,
                quote_volume_24h: 1_000_000.0,
                updated_at: 0,
            },
            candles: map,
            close_time: closes.len() as i64 * 60_000 - 1,
            timeframe: "1m".into(),
        }
    }

    fn eval_src(src: &str, view: &MarketView) -> Result<bool, EvalError> {
        let program = compile(src).expect("source compiles");
        let cancel = AtomicBool::new(false);
        run(&program, view, &cancel, DEFAULT_FUEL)
    }

    #[test]
    fn trivial_true() {
        let view = view_with_closes(&[100.0]);
        assert_eq!(eval_src("return true", &view), Ok(true));
    }

    #[test]
    fn falls_off_end_is_no_match() {
        let view = view_with_closes(&[100.0]);
        assert_eq!(eval_src("x := 1", &view), Ok(false));
    }

    #[test]
    fn ticker_reads() {
        let view = view_with_closes(&[100.0, 101.0]);
        assert_eq!(eval_src("return price() == 101", &view), Ok(true));
        assert_eq!(eval_src("return change24h() > 2", &view), Ok(true));
        assert_eq!(eval_src("return symbol() == \"BTCUSDT\"", &view), Ok(true));
    }

    #[test]
    fn candle_field_access() {
        let view = view_with_closes(&[100.0, 101.0, 102.0]);
        assert_eq!(eval_src("return close(\"1m\", 0) == 102", &view), Ok(true));
        assert_eq!(eval_src("return close(\"1m\", 2) == 100", &view), Ok(true));
        // Out of range is Nil, which compares false.
        assert_eq!(eval_src("return close(\"1m\", 9) == 100", &view), Ok(false));
    }

    #[test]
    fn indicator_with_insufficient_data_is_nil() {
        let view = view_with_closes(&[100.0, 101.0]);
        assert_eq!(eval_src("return sma(\"1m\", 50) > 0", &view), Ok(false));
        // Nil arithmetic stays nil, still no match, no error.
        assert_eq!(
            eval_src("return sma(\"1m\", 50) * 2 > 0", &view),
            Ok(false)
        );
    }

    #[test]
    fn indicator_happy_path() {
        let closes: Vec<f64> = (1..=60).map(|x| x as f64).collect();
        let view = view_with_closes(&closes);
        assert_eq!(eval_src("return sma(\"1m\", 10) > 50", &view), Ok(true));
        assert_eq!(eval_src("return rsi(\"1m\", 14) == 100", &view), Ok(true));
    }

    #[test]
    fn unknown_timeframe_is_runtime_error() {
        let view = view_with_closes(&[100.0]);
        let e = eval_src("return sma(\"4h\", 5) > 0", &view).unwrap_err();
        assert!(matches!(e, EvalError::Runtime(_)));
    }

    #[test]
    fn division_by_zero_is_nil() {
        let view = view_with_closes(&[100.0]);
        assert_eq!(eval_src("return 1 / 0 > 0", &view), Ok(false));
    }

    #[test]
    fn loop_with_counter() {
        let view = view_with_closes(&[100.0]);
        let src = r#"
            i := 0
            for i < 100 {
                i = i + 1
            }
            return i == 100
        "#;
        assert_eq!(eval_src(src, &view), Ok(true));
    }

    #[test]
    fn infinite_loop_exhausts_fuel() {
        let view = view_with_closes(&[100.0]);
        let program = compile("for { }").unwrap();
        let cancel = AtomicBool::new(false);
        let e = run(&program, &view, &cancel, 10_000).unwrap_err();
        assert_eq!(e, EvalError::OutOfFuel);
    }

    #[test]
    fn cancel_flag_stops_infinite_loop() {
        let view = view_with_closes(&[100.0]);
        let program = compile("for { }").unwrap();
        let cancel = AtomicBool::new(true);
        let e = run(&program, &view, &cancel, DEFAULT_FUEL).unwrap_err();
        assert_eq!(e, EvalError::Cancelled);
    }

    #[test]
    fn non_bool_return_is_error() {
        let view = view_with_closes(&[100.0]);
        assert!(matches!(
            eval_src("return 42", &view),
            Err(EvalError::Runtime(_))
        ));
    }

    #[test]
    fn engulfing_returns_label() {
        let view = view_with_closes(&[100.0, 101.0]);
        assert_eq!(
            eval_src("return engulfing(\"1m\") == \"none\"", &view),
            Ok(true)
        );
    }

    #[test]
    fn deterministic_across_runs() {
        let closes: Vec<f64> = (0..80).map(|x| 100.0 + ((x * 13) % 7) as f64).collect();
        let view = view_with_closes(&closes);
        let src = "return macd_hist(\"1m\", 12, 26, 9) > 0 && rsi(\"1m\", 14) < 70";
        let a = eval_src(src, &view);
        let b = eval_src(src, &view);
        assert_eq!(a, b);
    }
}
