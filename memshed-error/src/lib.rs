// Copyright 2024 The MemShed Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use serde::{Deserialize, Serialize};

#[macro_export]
macro_rules! make_err {
    ($code:expr, $($arg:tt)+) => {{
        $crate::Error::new($code, format!("{}", format_args!($($arg)+)))
    }};
}

#[macro_export]
macro_rules! make_input_err {
    ($($arg:tt)+) => {{
        $crate::make_err!($crate::Code::InvalidArgument, $($arg)+)
    }};
}

#[macro_export]
macro_rules! error_if {
    ($cond:expr, $($arg:tt)+) => {{
        if $cond {
            return Err($crate::make_err!($crate::Code::InvalidArgument, $($arg)+));
        }
    }};
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Error {
    pub code: Code,
    pub messages: Vec<String>,
}

impl Error {
    pub fn new(code: Code, msg: String) -> Self {
        let mut messages = Vec::with_capacity(1);
        if !msg.is_empty() {
            messages.push(msg);
        }
        Self { code, messages }
    }

    #[inline]
    #[must_use]
    pub fn append<S: Into<String>>(mut self, msg: S) -> Self {
        self.messages.push(msg.into());
        self
    }

    /// Merges both errors into one, preferring the code of `self` unless it
    /// is `Code::Internal`, in which case the other error's code wins.
    #[must_use]
    pub fn merge(mut self, mut other: Self) -> Self {
        let mut code = self.code;
        if code == Code::Internal {
            code = other.code;
        }
        self.messages.append(&mut other.messages);
        Self {
            code,
            messages: self.messages,
        }
    }

    #[must_use]
    pub fn merge_option(this: Option<Self>, other: Option<Self>) -> Option<Self> {
        match (this, other) {
            (Some(this), Some(other)) => Some(this.merge(other)),
            (Some(this), None) => Some(this),
            (None, other) => other,
        }
    }

    pub fn messages_string(&self) -> String {
        self.messages.join(" : ")
    }
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Error {{ code: {:?}, messages: [", self.code)?;
        let mut first = true;
        for msg in &self.messages {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "{msg:?}")?;
            first = false;
        }
        f.write_str("] }")
    }
}

impl From<Code> for Error {
    fn from(code: Code) -> Self {
        Self {
            code,
            messages: vec![],
        }
    }
}

/// Status codes, mirroring the canonical RPC code set so errors can cross the
/// wire unchanged.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Code {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

pub trait ResultExt<T> {
    fn err_tip_with_code<F, S>(self, tip_fn: F) -> Result<T, Error>
    where
        Self: Sized,
        S: Into<String>,
        F: (FnOnce(&Error) -> (Code, S)) + Sized;

    #[inline]
    fn err_tip<F, S>(self, tip_fn: F) -> Result<T, Error>
    where
        Self: Sized,
        S: Into<String>,
        F: (FnOnce() -> S) + Sized,
    {
        self.err_tip_with_code(|e| (e.code, tip_fn()))
    }
}

impl<T, E: Into<Error>> ResultExt<T> for Result<T, E> {
    fn err_tip_with_code<F, S>(self, tip_fn: F) -> Result<T, Error>
    where
        Self: Sized,
        S: Into<String>,
        F: (FnOnce(&Error) -> (Code, S)) + Sized,
    {
        self.map_err(|e| {
            let mut error: Error = e.into();
            let (code, message) = tip_fn(&error);
            error.code = code;
            error.messages.push(message.into());
            error
        })
    }
}

impl<T> ResultExt<T> for Option<T> {
    fn err_tip_with_code<F, S>(self, tip_fn: F) -> Result<T, Error>
    where
        Self: Sized,
        S: Into<String>,
        F: (FnOnce(&Error) -> (Code, S)) + Sized,
    {
        self.ok_or_else(|| {
            let mut error = Error {
                code: Code::Internal,
                messages: vec![],
            };
            let (code, message) = tip_fn(&error);
            error.code = code;
            error.messages.push(message.into());
            error
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn err_tip_appends_message_and_keeps_code() {
        let res: Result<(), Error> = Err(make_err!(Code::NotFound, "worker {} missing", "a"));
        let err = res.err_tip(|| "while doing thing").unwrap_err();
        assert_eq!(err.code, Code::NotFound);
        assert_eq!(
            err.messages,
            vec!["worker a missing".to_string(), "while doing thing".to_string()]
        );
    }

    #[test]
    fn option_err_tip_uses_internal_code() {
        let res: Option<u32> = None;
        let err = res.err_tip(|| "missing value").unwrap_err();
        assert_eq!(err.code, Code::Internal);
        assert_eq!(err.messages_string(), "missing value");
    }

    #[test]
    fn merge_prefers_non_internal_code() {
        let a = make_err!(Code::Internal, "a");
        let b = make_err!(Code::Unavailable, "b");
        let merged = a.merge(b);
        assert_eq!(merged.code, Code::Unavailable);
        assert_eq!(merged.messages_string(), "a : b");
        assert_eq!(
            Error::merge_option(Some(make_err!(Code::Aborted, "x")), None)
                .unwrap()
                .code,
            Code::Aborted
        );
    }

    #[test]
    fn append_and_code_conversion() {
        let err = Error::from(Code::NotFound).append("context");
        assert_eq!(err.code, Code::NotFound);
        assert_eq!(err.messages_string(), "context");
        let res: Result<(), Error> = Err(make_input_err!("bad input {}", 3));
        assert_eq!(res.unwrap_err().code, Code::InvalidArgument);
    }
}
