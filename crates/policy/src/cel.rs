//! Seam to the CEL evaluator. Policies compile every expression once at
//! load time and evaluate the compiled program per object.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value as Json;

/// Variables visible to an expression, e.g. `object` or `value`.
pub type Bindings = BTreeMap<String, Json>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CelError {
    #[error("compile {expr:?}: {message}")]
    Compile { expr: String, message: String },
    #[error("evaluate: {0}")]
    Eval(String),
    #[error("expression returned {0}, expected bool")]
    NotBool(String),
}

/// A compiled expression.
pub trait CelProgram: Send + Sync + fmt::Debug {
    fn eval(&self, bindings: &Bindings) -> Result<bool, CelError>;
}

pub trait CelEngine: Send + Sync {
    fn compile(&self, expr: &str) -> Result<Arc<dyn CelProgram>, CelError>;
}

/// Engine used when no evaluator is built in: every CEL rule is rejected at
/// policy load time instead of silently passing.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledCel;

impl CelEngine for DisabledCel {
    fn compile(&self, expr: &str) -> Result<Arc<dyn CelProgram>, CelError> {
        Err(CelError::Compile {
            expr: expr.to_string(),
            message: "CEL support is not enabled in this build".into(),
        })
    }
}

/// Best engine available in this build.
#[cfg(feature = "cel")]
pub fn default_engine() -> Arc<dyn CelEngine> {
    Arc::new(interpreter::InterpreterCel)
}

/// Best engine available in this build.
#[cfg(not(feature = "cel"))]
pub fn default_engine() -> Arc<dyn CelEngine> {
    Arc::new(DisabledCel)
}

#[cfg(feature = "cel")]
pub use interpreter::InterpreterCel;

#[cfg(feature = "cel")]
mod interpreter {
    use super::*;
    use cel_interpreter::{Context, Program, Value};

    /// CEL engine backed by the `cel-interpreter` crate.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct InterpreterCel;

    struct Compiled {
        expr: String,
        program: Program,
    }

    impl fmt::Debug for Compiled {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("Compiled").field("expr", &self.expr).finish()
        }
    }

    impl CelProgram for Compiled {
        fn eval(&self, bindings: &Bindings) -> Result<bool, CelError> {
            let mut ctx = Context::default();
            for (name, value) in bindings {
                ctx.add_variable(name.as_str(), value.clone()).map_err(|e| CelError::Eval(e.to_string()))?;
            }
            match self.program.execute(&ctx) {
                Ok(Value::Bool(b)) => Ok(b),
                Ok(other) => Err(CelError::NotBool(format!("{other:?}"))),
                Err(e) => Err(CelError::Eval(e.to_string())),
            }
        }
    }

    impl CelEngine for InterpreterCel {
        fn compile(&self, expr: &str) -> Result<Arc<dyn CelProgram>, CelError> {
            let program = Program::compile(expr)
                .map_err(|e| CelError::Compile { expr: expr.to_string(), message: e.to_string() })?;
            Ok(Arc::new(Compiled { expr: expr.to_string(), program }))
        }
    }

}
