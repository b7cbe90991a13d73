//! Operator and function registry.
//!
//! Every operation a definition can invoke lives here: the fixed operator
//! table and the function table. An implementation supplies three things: a
//! value method computing a physical array from its arguments, a unit rule
//! and a dimension rule. The rules return the result metadata together with
//! the metadata each argument is *required* to arrive in; the reconciler
//! consults them and inserts `convert` and `transpose` nodes wherever a data
//! edge does not already satisfy its requirement.
//!
//! The registry is populated at startup and closed afterwards, so lookups are
//! cheap and the set of reachable operations is auditable.

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::array::{Datatype, PhysArray, Positive, ShapeError};
use crate::parse::OpSymbol;
use crate::units::{Units, UnitsError};

#[derive(Debug)]
pub enum LookupError {
    UnknownOperator(String),
    UnknownFunction(String),
    WrongArity { name: String, arity: usize },
    UnknownVariable(String),
    UnknownKeyword { name: String, keyword: String },
}

impl fmt::Display for LookupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LookupError::UnknownOperator(symbol) => {
                write!(f, "unknown operator \"{}\"", symbol)
            }
            LookupError::UnknownFunction(name) => write!(f, "unknown function \"{}\"", name),
            LookupError::WrongArity { name, arity } => {
                write!(f, "function \"{}\" cannot take {} arguments", name, arity)
            }
            LookupError::UnknownVariable(name) => write!(f, "unknown variable \"{}\"", name),
            LookupError::UnknownKeyword { name, keyword } => {
                write!(f, "function \"{}\" has no keyword \"{}\"", name, keyword)
            }
        }
    }
}

#[derive(Debug)]
pub enum FunctionError {
    Units(UnitsError),
    Shape(ShapeError),
    Positive { reason: String },
    Argument { function: String, reason: String },
}

impl From<UnitsError> for FunctionError {
    fn from(err: UnitsError) -> Self {
        FunctionError::Units(err)
    }
}

impl From<ShapeError> for FunctionError {
    fn from(err: ShapeError) -> Self {
        FunctionError::Shape(err)
    }
}

impl fmt::Display for FunctionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FunctionError::Units(err) => write!(f, "{}", err),
            FunctionError::Shape(err) => write!(f, "{}", err),
            FunctionError::Positive { reason } => write!(f, "{}", reason),
            FunctionError::Argument { function, reason } => {
                write!(f, "invalid arguments to \"{}\": {}", function, reason)
            }
        }
    }
}

/// A fully evaluated argument passed to a value method.
#[derive(Clone, Debug)]
pub enum ArgValue {
    Array(PhysArray),
    Str(String),
}

impl ArgValue {
    pub fn as_array(&self) -> Option<&PhysArray> {
        match self {
            ArgValue::Array(array) => Some(array),
            ArgValue::Str(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ArgValue::Str(text) => Some(text),
            ArgValue::Array(_) => None,
        }
    }
}

/// Argument metadata given to the unit and dimension rules.
#[derive(Clone, Debug)]
pub enum ArgInfo {
    /// A data edge with its current metadata.
    Data {
        units: Units,
        dims: Vec<String>,
        positive: Option<Positive>,
    },
    /// A constant numeric literal.
    Num(f64),
    /// A constant string.
    Str(String),
}

impl ArgInfo {
    pub fn units(&self) -> Option<&Units> {
        match self {
            ArgInfo::Data { units, .. } => Some(units),
            _ => None,
        }
    }

    pub fn dims(&self) -> Option<&[String]> {
        match self {
            ArgInfo::Data { dims, .. } => Some(dims),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ArgInfo::Str(text) => Some(text),
            _ => None,
        }
    }
}

/// Unit rule result: the units the operation produces, and per argument the
/// units the argument must be coerced into (`None` meaning no constraint).
pub type UnitsRule = (Units, Vec<Option<Units>>);

/// Dimension rule result, same shape as [`UnitsRule`].
///
/// [`UnitsRule`]: type.UnitsRule.html
pub type DimsRule = (Vec<String>, Vec<Option<Vec<String>>>);

/// One registered operation.
pub trait Function {
    fn name(&self) -> &'static str;

    /// Computes the result from evaluated arguments.
    fn value(&self, args: &[ArgValue]) -> Result<PhysArray, FunctionError>;

    /// The unit rule (see the module documentation).
    fn units(&self, args: &[ArgInfo]) -> Result<UnitsRule, FunctionError>;

    /// The dimension rule.
    fn dims(&self, args: &[ArgInfo]) -> Result<DimsRule, FunctionError>;

    /// Dimensions this operation reduces over; requests along them are
    /// widened to the full axis before reaching the inputs.
    fn sum_dims(&self, _args: &[ArgInfo]) -> Vec<String> {
        Vec::new()
    }

    /// Positional slot a keyword argument maps into.
    fn keyword_slot(&self, _keyword: &str) -> Option<usize> {
        None
    }
}

/// Accepted argument counts of a registered function.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
}

impl Arity {
    fn accepts(&self, n_args: usize) -> bool {
        match self {
            Arity::Exact(exact) => n_args == *exact,
            Arity::AtLeast(least) => n_args >= *least,
        }
    }
}

/// The closed operator and function tables.
pub struct FunctionRegistry {
    operators: HashMap<OpSymbol, Rc<dyn Function>>,
    functions: HashMap<&'static str, Vec<(Arity, Rc<dyn Function>)>>,
}

impl FunctionRegistry {
    /// The registry with all built-in operators and functions.
    pub fn standard() -> Self {
        let mut registry = FunctionRegistry {
            operators: HashMap::new(),
            functions: HashMap::new(),
        };

        registry.operators.insert(OpSymbol::Neg, Rc::new(NegOp));
        for symbol in &[
            OpSymbol::Add,
            OpSymbol::Sub,
            OpSymbol::Mul,
            OpSymbol::Div,
            OpSymbol::Pow,
            OpSymbol::Lt,
            OpSymbol::Gt,
            OpSymbol::Le,
            OpSymbol::Ge,
            OpSymbol::Eq,
        ] {
            registry
                .operators
                .insert(*symbol, Rc::new(BinaryOp { symbol: *symbol }));
        }

        registry.register("sqrt", Arity::Exact(1), Rc::new(SqrtFunction));
        registry.register("convert", Arity::AtLeast(2), Rc::new(ConvertFunction));
        registry.register("transpose", Arity::AtLeast(2), Rc::new(TransposeFunction));
        registry.register("mean", Arity::AtLeast(2), Rc::new(MeanFunction));
        registry.register("limit", Arity::Exact(3), Rc::new(LimitFunction));

        registry
    }

    fn register(&mut self, name: &'static str, arity: Arity, implementation: Rc<dyn Function>) {
        self.functions
            .entry(name)
            .or_insert_with(Vec::new)
            .push((arity, implementation));
    }

    pub fn find_operator(&self, symbol: OpSymbol) -> Result<Rc<dyn Function>, LookupError> {
        self.operators
            .get(&symbol)
            .cloned()
            .ok_or_else(|| LookupError::UnknownOperator(symbol.symbol().to_owned()))
    }

    pub fn find_function(
        &self,
        name: &str,
        n_args: usize,
    ) -> Result<Rc<dyn Function>, LookupError> {
        let entries = self
            .functions
            .get(name)
            .ok_or_else(|| LookupError::UnknownFunction(name.to_owned()))?;

        entries
            .iter()
            .find(|(arity, _)| arity.accepts(n_args))
            .map(|(_, implementation)| implementation.clone())
            .ok_or_else(|| LookupError::WrongArity {
                name: name.to_owned(),
                arity: n_args,
            })
    }
}

fn data_arg<'a>(
    function: &str,
    args: &'a [ArgValue],
    slot: usize,
) -> Result<&'a PhysArray, FunctionError> {
    args.get(slot)
        .and_then(ArgValue::as_array)
        .ok_or_else(|| FunctionError::Argument {
            function: function.to_owned(),
            reason: format!("argument {} must be data", slot + 1),
        })
}

fn str_arg(function: &str, args: &[ArgValue], slot: usize) -> Result<String, FunctionError> {
    args.get(slot)
        .and_then(ArgValue::as_str)
        .map(str::to_owned)
        .ok_or_else(|| FunctionError::Argument {
            function: function.to_owned(),
            reason: format!("argument {} must be a string", slot + 1),
        })
}

fn merge_positive(
    left: Option<Positive>,
    right: Option<Positive>,
) -> Result<Option<Positive>, FunctionError> {
    match (left, right) {
        (Some(a), Some(b)) if a != b => Err(FunctionError::Positive {
            reason: format!(
                "operands have opposing positive directions \"{}\" and \"{}\"",
                a, b
            ),
        }),
        (Some(a), _) => Ok(Some(a)),
        (_, right) => Ok(right),
    }
}

struct NegOp;

impl Function for NegOp {
    fn name(&self) -> &'static str {
        "-"
    }

    fn value(&self, args: &[ArgValue]) -> Result<PhysArray, FunctionError> {
        let x = data_arg(self.name(), args, 0)?;
        let mut result = x.clone();
        for value in &mut result.data {
            *value = -*value;
        }
        result.name = format!("(-{})", x.name);
        Ok(result)
    }

    fn units(&self, args: &[ArgInfo]) -> Result<UnitsRule, FunctionError> {
        let units = args[0].units().cloned().unwrap_or_else(Units::one);
        Ok((units, vec![None]))
    }

    fn dims(&self, args: &[ArgInfo]) -> Result<DimsRule, FunctionError> {
        let dims = args[0].dims().map(<[String]>::to_vec).unwrap_or_default();
        Ok((dims, vec![None]))
    }
}

struct BinaryOp {
    symbol: OpSymbol,
}

impl BinaryOp {
    fn is_comparison(&self) -> bool {
        matches!(
            self.symbol,
            OpSymbol::Lt | OpSymbol::Gt | OpSymbol::Le | OpSymbol::Ge | OpSymbol::Eq
        )
    }

    fn combine(&self, a: f64, b: f64) -> f64 {
        match self.symbol {
            OpSymbol::Add => a + b,
            OpSymbol::Sub => a - b,
            OpSymbol::Mul => a * b,
            OpSymbol::Div => a / b,
            OpSymbol::Pow => a.powf(b),
            OpSymbol::Lt => (a < b) as i64 as f64,
            OpSymbol::Gt => (a > b) as i64 as f64,
            OpSymbol::Le => (a <= b) as i64 as f64,
            OpSymbol::Ge => (a >= b) as i64 as f64,
            OpSymbol::Eq => (a == b) as i64 as f64,
            OpSymbol::Neg => unreachable!(),
        }
    }

    /// Unit rule for `+`, `-` and the comparisons: the first data operand
    /// sets the frame, the other data operand must arrive in it. Subtraction
    /// of two reference times yields the plain interval.
    fn additive_units(&self, args: &[ArgInfo]) -> Result<UnitsRule, FunctionError> {
        let left = args[0].units();
        let right = args[1].units();

        let left_rt = left.map(Units::is_reference_time).unwrap_or(false);
        let right_rt = right.map(Units::is_reference_time).unwrap_or(false);

        if left_rt && right_rt {
            if self.symbol != OpSymbol::Sub && !self.is_comparison() {
                return Err(UnitsError::ReferenceTimeArithmetic(
                    self.symbol.symbol().to_owned(),
                )
                .into());
            }
            let anchor = left.unwrap().clone();
            let result = if self.is_comparison() {
                Units::one()
            } else {
                anchor.interval()
            };
            return Ok((result, vec![None, Some(anchor)]));
        }

        if right_rt && !left_rt {
            if self.symbol == OpSymbol::Sub || self.is_comparison() {
                return Err(UnitsError::ReferenceTimeArithmetic(
                    self.symbol.symbol().to_owned(),
                )
                .into());
            }
            // interval + time anchors on the right.
            let anchor = right.unwrap().clone();
            return Ok((anchor.clone(), vec![Some(anchor.interval()), None]));
        }

        let anchor = left
            .or(right)
            .cloned()
            .unwrap_or_else(Units::one);

        let result = if self.is_comparison() {
            Units::one()
        } else {
            anchor.clone()
        };

        let required_right = if left_rt {
            Some(anchor.interval())
        } else {
            Some(anchor.clone())
        };

        let required = vec![
            if args[0].units().is_some() {
                Some(anchor.clone())
            } else {
                None
            },
            if args[1].units().is_some() {
                required_right
            } else {
                None
            },
        ];

        Ok((result, required))
    }

    fn multiplicative_units(&self, args: &[ArgInfo]) -> Result<UnitsRule, FunctionError> {
        let left = args[0].units().cloned().unwrap_or_else(Units::one);
        let right = args[1].units().cloned().unwrap_or_else(Units::one);

        let result = match self.symbol {
            OpSymbol::Mul => left.multiply(&right)?,
            OpSymbol::Div => left.divide(&right)?,
            _ => unreachable!(),
        };

        Ok((result, vec![None, None]))
    }

    fn power_units(&self, args: &[ArgInfo]) -> Result<UnitsRule, FunctionError> {
        let base = args[0].units().cloned().unwrap_or_else(Units::one);

        // A literal integer exponent scales the base dimensions; anything
        // else demands a dimensionless base.
        if let ArgInfo::Num(exponent) = args[1] {
            if exponent.fract() == 0.0 {
                let result = base.pow(exponent as i32)?;
                return Ok((result, vec![None, None]));
            }
        }

        if base != Units::one() {
            return Err(UnitsError::NotRootable(base.to_string()).into());
        }

        Ok((
            Units::one(),
            vec![None, args[1].units().map(|_| Units::one())],
        ))
    }
}

impl Function for BinaryOp {
    fn name(&self) -> &'static str {
        self.symbol.symbol()
    }

    fn value(&self, args: &[ArgValue]) -> Result<PhysArray, FunctionError> {
        let left = data_arg(self.name(), args, 0)?;
        let right = data_arg(self.name(), args, 1)?;

        let (data, shape, dims) = left.zip_with(right, |a, b| self.combine(a, b))?;

        let (units, datatype) = if self.is_comparison() {
            (Units::one(), Datatype::I64)
        } else if self.symbol == OpSymbol::Mul {
            (
                left.units.multiply(&right.units)?,
                left.datatype.promote(right.datatype),
            )
        } else if self.symbol == OpSymbol::Div {
            (left.units.divide(&right.units)?, Datatype::F64)
        } else if self.symbol == OpSymbol::Sub
            && left.units.is_reference_time()
            && right.units.is_reference_time()
        {
            (left.units.interval(), Datatype::F64)
        } else if self.symbol == OpSymbol::Pow {
            let exponent = if right.is_scalar() {
                ArgInfo::Num(right.data[0])
            } else {
                info_of(right)
            };
            (
                self.power_units(&[info_of(left), exponent])?.0,
                Datatype::F64,
            )
        } else if right.units.is_reference_time() || left.units == Units::one() {
            (right.units.clone(), left.datatype.promote(right.datatype))
        } else {
            (left.units.clone(), left.datatype.promote(right.datatype))
        };

        let positive = if self.is_comparison() {
            None
        } else {
            merge_positive(left.positive, right.positive)?
        };

        Ok(PhysArray {
            name: format!("({}{}{})", left.name, self.symbol, right.name),
            data,
            shape,
            dims,
            units,
            positive,
            datatype,
        })
    }

    fn units(&self, args: &[ArgInfo]) -> Result<UnitsRule, FunctionError> {
        match self.symbol {
            OpSymbol::Mul | OpSymbol::Div => self.multiplicative_units(args),
            OpSymbol::Pow => self.power_units(args),
            _ => self.additive_units(args),
        }
    }

    fn dims(&self, args: &[ArgInfo]) -> Result<DimsRule, FunctionError> {
        elementwise_dims(args)
    }
}

/// Dimension rule shared by the elementwise operations: the first
/// non-scalar data operand sets the order, every other non-scalar data
/// operand must arrive in it.
fn elementwise_dims(args: &[ArgInfo]) -> Result<DimsRule, FunctionError> {
    let result = args
        .iter()
        .filter_map(ArgInfo::dims)
        .find(|dims| !dims.is_empty())
        .map(<[String]>::to_vec)
        .unwrap_or_default();

    let required = args
        .iter()
        .map(|arg| match arg.dims() {
            Some(dims) if !dims.is_empty() => Some(result.clone()),
            _ => None,
        })
        .collect();

    Ok((result, required))
}

fn info_of(array: &PhysArray) -> ArgInfo {
    ArgInfo::Data {
        units: array.units.clone(),
        dims: array.dims.clone(),
        positive: array.positive,
    }
}

struct SqrtFunction;

impl Function for SqrtFunction {
    fn name(&self) -> &'static str {
        "sqrt"
    }

    fn value(&self, args: &[ArgValue]) -> Result<PhysArray, FunctionError> {
        let x = data_arg(self.name(), args, 0)?;
        let mut result = x.clone();
        for value in &mut result.data {
            *value = value.sqrt();
        }
        result.name = format!("sqrt({})", x.name);
        result.units = x.units.root(2)?;
        result.datatype = Datatype::F64;
        Ok(result)
    }

    fn units(&self, args: &[ArgInfo]) -> Result<UnitsRule, FunctionError> {
        let units = args[0].units().cloned().unwrap_or_else(Units::one);
        Ok((units.root(2)?, vec![None]))
    }

    fn dims(&self, args: &[ArgInfo]) -> Result<DimsRule, FunctionError> {
        let dims = args[0].dims().map(<[String]>::to_vec).unwrap_or_default();
        Ok((dims, vec![None]))
    }
}

struct ConvertFunction;

impl ConvertFunction {
    /// The target units: parsed from the `to` argument, inheriting the
    /// source calendar unless one is given explicitly.
    fn target(&self, source: Option<&Units>, to: &str, calendar: Option<&str>)
        -> Result<Units, FunctionError> {
        let calendar_name;
        let calendar = match calendar {
            Some(name) => Some(name),
            None => match source.and_then(Units::calendar) {
                Some(calendar) => {
                    calendar_name = calendar.to_string();
                    Some(calendar_name.as_str())
                }
                None => None,
            },
        };
        Ok(Units::parse(to, calendar)?)
    }
}

impl Function for ConvertFunction {
    fn name(&self) -> &'static str {
        "convert"
    }

    fn keyword_slot(&self, keyword: &str) -> Option<usize> {
        match keyword {
            "to" => Some(1),
            "calendar" => Some(2),
            _ => None,
        }
    }

    fn value(&self, args: &[ArgValue]) -> Result<PhysArray, FunctionError> {
        let x = data_arg(self.name(), args, 0)?;
        let to = str_arg(self.name(), args, 1)?;
        let calendar = args.get(2).and_then(ArgValue::as_str);

        let target = self.target(Some(&x.units), &to, calendar)?;

        let mut result = x.clone();
        x.units.convert_values(&target, &mut result.data)?;
        result.units = target;
        result.datatype = Datatype::F64;
        result.name = format!("convert({}, to='{}')", x.name, to);
        Ok(result)
    }

    fn units(&self, args: &[ArgInfo]) -> Result<UnitsRule, FunctionError> {
        let source = args[0].units();
        let to = args[1].as_str().ok_or_else(|| FunctionError::Argument {
            function: self.name().to_owned(),
            reason: String::from("target units must be a string"),
        })?;
        let calendar = args.get(2).and_then(ArgInfo::as_str);

        let target = self.target(source, to, calendar)?;
        if let Some(source) = source {
            if !source.is_convertible(&target) {
                // Surface the precise failure: calendar mismatch reads
                // differently from incompatible dimensions.
                source.conversion(&target)?;
            }
        }

        Ok((target, vec![None; args.len()]))
    }

    fn dims(&self, args: &[ArgInfo]) -> Result<DimsRule, FunctionError> {
        let dims = args[0].dims().map(<[String]>::to_vec).unwrap_or_default();
        let required = vec![None; args.len()];
        Ok((dims, required))
    }
}

struct TransposeFunction;

impl TransposeFunction {
    fn new_dims(&self, args: &[ArgValue]) -> Result<Vec<String>, FunctionError> {
        (1..args.len())
            .map(|slot| str_arg(self.name(), args, slot))
            .collect()
    }
}

impl Function for TransposeFunction {
    fn name(&self) -> &'static str {
        "transpose"
    }

    fn value(&self, args: &[ArgValue]) -> Result<PhysArray, FunctionError> {
        let x = data_arg(self.name(), args, 0)?;
        let new_dims = self.new_dims(args)?;

        let mut result = x.transposed(&new_dims)?;
        result.name = format!("transpose({}, dims=[{}])", x.name, new_dims.join(","));
        Ok(result)
    }

    fn units(&self, args: &[ArgInfo]) -> Result<UnitsRule, FunctionError> {
        let units = args[0].units().cloned().unwrap_or_else(Units::one);
        Ok((units, vec![None; args.len()]))
    }

    fn dims(&self, args: &[ArgInfo]) -> Result<DimsRule, FunctionError> {
        let new_dims = args[1..]
            .iter()
            .map(|arg| {
                arg.as_str()
                    .map(str::to_owned)
                    .ok_or_else(|| FunctionError::Argument {
                        function: self.name().to_owned(),
                        reason: String::from("dimension names must be strings"),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok((new_dims, vec![None; args.len()]))
    }
}

struct MeanFunction;

impl MeanFunction {
    fn reduced(&self, args: &[ArgInfo]) -> Vec<String> {
        args[1..]
            .iter()
            .filter_map(|arg| arg.as_str().map(str::to_owned))
            .collect()
    }
}

impl Function for MeanFunction {
    fn name(&self) -> &'static str {
        "mean"
    }

    fn value(&self, args: &[ArgValue]) -> Result<PhysArray, FunctionError> {
        let x = data_arg(self.name(), args, 0)?;
        let reduce = (1..args.len())
            .map(|slot| str_arg(self.name(), args, slot))
            .collect::<Result<Vec<_>, _>>()?;

        let mut result = x.mean_over(&reduce)?;
        result.name = format!("mean({}, dims=[{}])", x.name, reduce.join(","));
        Ok(result)
    }

    fn units(&self, args: &[ArgInfo]) -> Result<UnitsRule, FunctionError> {
        let units = args[0].units().cloned().unwrap_or_else(Units::one);
        Ok((units, vec![None; args.len()]))
    }

    fn dims(&self, args: &[ArgInfo]) -> Result<DimsRule, FunctionError> {
        let reduce = self.reduced(args);
        let dims = args[0]
            .dims()
            .map(<[String]>::to_vec)
            .unwrap_or_default()
            .into_iter()
            .filter(|dim| !reduce.contains(dim))
            .collect();
        Ok((dims, vec![None; args.len()]))
    }

    fn sum_dims(&self, args: &[ArgInfo]) -> Vec<String> {
        self.reduced(args)
    }
}

struct LimitFunction;

impl Function for LimitFunction {
    fn name(&self) -> &'static str {
        "limit"
    }

    fn keyword_slot(&self, keyword: &str) -> Option<usize> {
        match keyword {
            "below" => Some(1),
            "above" => Some(2),
            _ => None,
        }
    }

    fn value(&self, args: &[ArgValue]) -> Result<PhysArray, FunctionError> {
        let x = data_arg(self.name(), args, 0)?;
        let below = data_arg(self.name(), args, 1)?;
        let above = data_arg(self.name(), args, 2)?;

        let (data, shape, dims) = x.zip_with(below, |value, low| value.max(low))?;
        let clamped = PhysArray {
            data,
            shape,
            dims,
            ..x.clone()
        };
        let (data, shape, dims) = clamped.zip_with(above, |value, high| value.min(high))?;

        Ok(PhysArray {
            name: format!(
                "limit({}, below={}, above={})",
                x.name, below.name, above.name
            ),
            data,
            shape,
            dims,
            units: x.units.clone(),
            positive: x.positive,
            datatype: x.datatype,
        })
    }

    fn units(&self, args: &[ArgInfo]) -> Result<UnitsRule, FunctionError> {
        let units = args[0].units().cloned().unwrap_or_else(Units::one);
        let required = args
            .iter()
            .enumerate()
            .map(|(slot, arg)| {
                if slot > 0 && arg.units().is_some() {
                    Some(units.clone())
                } else {
                    None
                }
            })
            .collect();
        Ok((units, required))
    }

    fn dims(&self, args: &[ArgInfo]) -> Result<DimsRule, FunctionError> {
        elementwise_dims(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn array(name: &str, data: Vec<f64>, dims: &[&str], units: &str) -> PhysArray {
        let shape = vec![data.len()];
        PhysArray {
            name: name.to_owned(),
            data,
            shape,
            dims: dims.iter().map(|dim| (*dim).to_owned()).collect(),
            units: Units::parse(units, None).unwrap(),
            positive: None,
            datatype: Datatype::F64,
        }
    }

    #[test]
    fn lookup_operators_and_functions() {
        let registry = FunctionRegistry::standard();
        assert!(registry.find_operator(OpSymbol::Add).is_ok());
        assert!(registry.find_function("sqrt", 1).is_ok());
        assert!(matches!(
            registry.find_function("sqrt", 2),
            Err(LookupError::WrongArity { .. })
        ));
        assert!(matches!(
            registry.find_function("nope", 1),
            Err(LookupError::UnknownFunction(_))
        ));
    }

    #[test]
    fn addition_requires_left_units() {
        let registry = FunctionRegistry::standard();
        let add = registry.find_operator(OpSymbol::Add).unwrap();

        let args = vec![
            ArgInfo::Data {
                units: Units::parse("m", None).unwrap(),
                dims: vec![String::from("x")],
                positive: None,
            },
            ArgInfo::Data {
                units: Units::parse("km", None).unwrap(),
                dims: vec![String::from("x")],
                positive: None,
            },
        ];
        let (result, required) = add.units(&args).unwrap();
        assert_eq!(result, Units::parse("m", None).unwrap());
        assert_eq!(required[1], Some(Units::parse("m", None).unwrap()));
    }

    #[test]
    fn multiplication_combines_units() {
        let registry = FunctionRegistry::standard();
        let mul = registry.find_operator(OpSymbol::Mul).unwrap();

        let args = vec![
            ArgInfo::Data {
                units: Units::parse("m", None).unwrap(),
                dims: vec![String::from("x")],
                positive: None,
            },
            ArgInfo::Data {
                units: Units::parse("s-1", None).unwrap(),
                dims: vec![String::from("x")],
                positive: None,
            },
        ];
        let (result, required) = mul.units(&args).unwrap();
        assert_eq!(result, Units::parse("m/s", None).unwrap());
        assert_eq!(required, vec![None, None]);
    }

    #[test]
    fn comparison_is_dimensionless() {
        let registry = FunctionRegistry::standard();
        let lt = registry.find_operator(OpSymbol::Lt).unwrap();

        let left = array("a", vec![1.0, 5.0], &["x"], "m");
        let right = array("b", vec![2.0, 2.0], &["x"], "m");
        let result = lt
            .value(&[ArgValue::Array(left), ArgValue::Array(right)])
            .unwrap();
        assert_eq!(result.data, vec![1.0, 0.0]);
        assert_eq!(result.units, Units::one());
        assert_eq!(result.name, "(a<b)");
    }

    #[test]
    fn subtraction_of_reference_times_is_an_interval() {
        let registry = FunctionRegistry::standard();
        let sub = registry.find_operator(OpSymbol::Sub).unwrap();

        let time = Units::parse("days since 2000-01-01", None).unwrap();
        let args = vec![
            ArgInfo::Data {
                units: time.clone(),
                dims: vec![String::from("t")],
                positive: None,
            },
            ArgInfo::Data {
                units: time.clone(),
                dims: vec![String::from("t")],
                positive: None,
            },
        ];
        let (result, required) = sub.units(&args).unwrap();
        assert_eq!(result, Units::parse("day", None).unwrap());
        assert_eq!(required[1], Some(time));
    }

    #[test]
    fn addition_of_reference_times_is_rejected() {
        let registry = FunctionRegistry::standard();
        let add = registry.find_operator(OpSymbol::Add).unwrap();

        let time = Units::parse("days since 2000-01-01", None).unwrap();
        let args = vec![
            ArgInfo::Data {
                units: time.clone(),
                dims: vec![],
                positive: None,
            },
            ArgInfo::Data {
                units: time,
                dims: vec![],
                positive: None,
            },
        ];
        assert!(matches!(
            add.units(&args),
            Err(FunctionError::Units(UnitsError::ReferenceTimeArithmetic(_)))
        ));
    }

    #[test]
    fn power_with_integer_literal_scales_units() {
        let registry = FunctionRegistry::standard();
        let pow = registry.find_operator(OpSymbol::Pow).unwrap();

        let args = vec![
            ArgInfo::Data {
                units: Units::parse("m", None).unwrap(),
                dims: vec![String::from("x")],
                positive: None,
            },
            ArgInfo::Num(2.0),
        ];
        let (result, _) = pow.units(&args).unwrap();
        assert_eq!(result, Units::parse("m2", None).unwrap());
    }

    #[test]
    fn power_with_fractional_literal_requires_dimensionless_base() {
        let registry = FunctionRegistry::standard();
        let pow = registry.find_operator(OpSymbol::Pow).unwrap();

        let args = vec![
            ArgInfo::Data {
                units: Units::parse("m", None).unwrap(),
                dims: vec![String::from("x")],
                positive: None,
            },
            ArgInfo::Num(0.5),
        ];
        assert!(pow.units(&args).is_err());
    }

    #[test]
    fn sqrt_roots_units() {
        let registry = FunctionRegistry::standard();
        let sqrt = registry.find_function("sqrt", 1).unwrap();

        let x = array("x", vec![4.0, 9.0], &["x"], "m2");
        let result = sqrt.value(&[ArgValue::Array(x)]).unwrap();
        assert_eq!(result.data, vec![2.0, 3.0]);
        assert_eq!(result.units, Units::parse("m", None).unwrap());
        assert_eq!(result.name, "sqrt(x)");
    }

    #[test]
    fn convert_applies_the_linear_map() {
        let registry = FunctionRegistry::standard();
        let convert = registry.find_function("convert", 2).unwrap();

        let x = array("T", vec![273.15, 283.15], &["t"], "K");
        let result = convert
            .value(&[ArgValue::Array(x), ArgValue::Str(String::from("degC"))])
            .unwrap();
        assert!((result.data[0] - 0.0).abs() < 1e-9);
        assert!((result.data[1] - 10.0).abs() < 1e-9);
        assert_eq!(result.name, "convert(T, to='degC')");
    }

    #[test]
    fn chained_conversions_compose() {
        let registry = FunctionRegistry::standard();
        let convert = registry.find_function("convert", 2).unwrap();

        let x = array("x", vec![1.0, 2.5], &["x"], "km");

        let through_m = convert
            .value(&[ArgValue::Array(x.clone()), ArgValue::Str(String::from("m"))])
            .unwrap();
        let chained = convert
            .value(&[ArgValue::Array(through_m), ArgValue::Str(String::from("cm"))])
            .unwrap();
        let direct = convert
            .value(&[ArgValue::Array(x), ArgValue::Str(String::from("cm"))])
            .unwrap();

        assert_eq!(chained.data, direct.data);
        assert_eq!(chained.units, direct.units);
    }

    #[test]
    fn chained_transposes_compose() {
        let registry = FunctionRegistry::standard();
        let transpose = registry.find_function("transpose", 3).unwrap();

        let x = PhysArray {
            name: String::from("x"),
            data: vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
            shape: vec![2, 3],
            dims: vec![String::from("a"), String::from("b")],
            units: Units::one(),
            positive: None,
            datatype: Datatype::F64,
        };

        let swapped = transpose
            .value(&[
                ArgValue::Array(x.clone()),
                ArgValue::Str(String::from("b")),
                ArgValue::Str(String::from("a")),
            ])
            .unwrap();
        let back = transpose
            .value(&[
                ArgValue::Array(swapped),
                ArgValue::Str(String::from("a")),
                ArgValue::Str(String::from("b")),
            ])
            .unwrap();

        assert_eq!(back.data, x.data);
        assert_eq!(back.dims, x.dims);
        assert_eq!(back.shape, x.shape);
    }

    #[test]
    fn convert_to_unconvertible_units_fails() {
        let registry = FunctionRegistry::standard();
        let convert = registry.find_function("convert", 2).unwrap();

        let args = vec![
            ArgInfo::Data {
                units: Units::parse("Pa", None).unwrap(),
                dims: vec![],
                positive: None,
            },
            ArgInfo::Str(String::from("m")),
        ];
        assert!(matches!(
            convert.units(&args),
            Err(FunctionError::Units(UnitsError::NotConvertible { .. }))
        ));
    }

    #[test]
    fn transpose_declares_new_dims() {
        let registry = FunctionRegistry::standard();
        let transpose = registry.find_function("transpose", 3).unwrap();

        let args = vec![
            ArgInfo::Data {
                units: Units::one(),
                dims: vec![String::from("t"), String::from("x")],
                positive: None,
            },
            ArgInfo::Str(String::from("x")),
            ArgInfo::Str(String::from("t")),
        ];
        let (dims, _) = transpose.dims(&args).unwrap();
        assert_eq!(dims, vec![String::from("x"), String::from("t")]);
    }

    #[test]
    fn mean_reduces_and_declares_sum_dims() {
        let registry = FunctionRegistry::standard();
        let mean = registry.find_function("mean", 2).unwrap();

        let args = vec![
            ArgInfo::Data {
                units: Units::parse("K", None).unwrap(),
                dims: vec![String::from("t"), String::from("x")],
                positive: None,
            },
            ArgInfo::Str(String::from("t")),
        ];
        let (dims, _) = mean.dims(&args).unwrap();
        assert_eq!(dims, vec![String::from("x")]);
        assert_eq!(mean.sum_dims(&args), vec![String::from("t")]);
    }

    #[test]
    fn limit_clamps_both_sides() {
        let registry = FunctionRegistry::standard();
        let limit = registry.find_function("limit", 3).unwrap();

        let x = array("x", vec![-5.0, 0.5, 5.0], &["x"], "1");
        let result = limit
            .value(&[
                ArgValue::Array(x),
                ArgValue::Array(PhysArray::scalar("0", 0.0, Datatype::I64)),
                ArgValue::Array(PhysArray::scalar("1", 1.0, Datatype::I64)),
            ])
            .unwrap();
        assert_eq!(result.data, vec![0.0, 0.5, 1.0]);
    }

    #[test]
    fn opposing_positive_directions_are_rejected() {
        let registry = FunctionRegistry::standard();
        let add = registry.find_operator(OpSymbol::Add).unwrap();

        let mut left = array("a", vec![1.0], &["x"], "m");
        left.positive = Some(Positive::Up);
        let mut right = array("b", vec![1.0], &["x"], "m");
        right.positive = Some(Positive::Down);

        assert!(matches!(
            add.value(&[ArgValue::Array(left), ArgValue::Array(right)]),
            Err(FunctionError::Positive { .. })
        ));
    }
}
