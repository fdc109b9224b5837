use crate::error::EngineError;
use miette::Diagnostic;
use serde::Serialize;
use serde_json::Value;
use std::io::{self, Write};

/// One line of output: the command's result or the error it produced.
#[derive(Debug, Serialize)]
pub struct Outcome<'a> {
    pub line: usize,
    pub op: &'a str,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl From<&EngineError> for ErrorBody {
    fn from(error: &EngineError) -> Self {
        Self {
            code: error
                .code()
                .map(|code| code.to_string())
                .unwrap_or_else(|| "paylifecycle::internal".to_string()),
            message: error.to_string(),
        }
    }
}

/// Writes one JSON object per line.
pub struct ResultWriter<W: Write> {
    writer: W,
}

impl<W: Write> ResultWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn write_ok(&mut self, line: usize, op: &str, result: Value) -> io::Result<()> {
        self.write(&Outcome {
            line,
            op,
            ok: true,
            result: Some(result),
            error: None,
        })
    }

    pub fn write_err(&mut self, line: usize, op: &str, error: &EngineError) -> io::Result<()> {
        self.write(&Outcome {
            line,
            op,
            ok: false,
            result: None,
            error: Some(error.into()),
        })
    }

    fn write(&mut self, outcome: &Outcome<'_>) -> io::Result<()> {
        serde_json::to_writer(&mut self.writer, outcome)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }
}
