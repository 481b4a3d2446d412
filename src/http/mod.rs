//! HTTP/1.1 protocol types and parsing.
//!
//! This module provides the primitives every other layer speaks:
//! [`Method`], [`StatusCode`], [`Headers`], [`Request`], [`Response`], plus the
//! `multipart/form-data` decoder ([`multipart`]) and the temp-file descriptor it
//! produces ([`UploadedFile`]).

use std::fmt;

pub mod headers;
pub mod multipart;
pub mod request;
pub mod response;
pub mod upload;

pub use headers::Headers;
pub use multipart::{MultipartData, MultipartError, MultipartLimits, MultipartParser};
pub use request::{Request, RequestHead};
pub use response::{Body, Response};
pub use upload::{UploadScope, UploadedFile};

macro_rules! status_codes {
    ($($variant:ident = $code:literal, $reason:literal;)+) => {
        /// An HTTP response status code.
        ///
        /// Only the codes the framework and its middleware produce are listed.
        ///
        /// # Examples
        ///
        /// ```
        /// use rttp_kernel::http::StatusCode;
        ///
        /// let status = StatusCode::Ok;
        /// assert_eq!(status.as_u16(), 200);
        /// assert_eq!(status.canonical_reason(), "OK");
        /// assert_eq!(StatusCode::from_u16(413), Some(StatusCode::PayloadTooLarge));
        /// ```
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u16)]
        pub enum StatusCode {
            $($variant = $code,)+
        }

        impl StatusCode {
            pub fn as_u16(self) -> u16 {
                self as u16
            }

            /// The known status for `code`, if any.
            pub fn from_u16(code: u16) -> Option<Self> {
                match code {
                    $($code => Some(Self::$variant),)+
                    _ => None,
                }
            }

            /// Reason phrase written on the status line.
            pub fn canonical_reason(self) -> &'static str {
                match self {
                    $(Self::$variant => $reason,)+
                }
            }
        }
    };
}

status_codes! {
    Ok = 200, "OK";
    Created = 201, "Created";
    Accepted = 202, "Accepted";
    NoContent = 204, "No Content";
    MovedPermanently = 301, "Moved Permanently";
    Found = 302, "Found";
    SeeOther = 303, "See Other";
    NotModified = 304, "Not Modified";
    BadRequest = 400, "Bad Request";
    Unauthorized = 401, "Unauthorized";
    Forbidden = 403, "Forbidden";
    NotFound = 404, "Not Found";
    MethodNotAllowed = 405, "Method Not Allowed";
    NotAcceptable = 406, "Not Acceptable";
    Conflict = 409, "Conflict";
    PreconditionFailed = 412, "Precondition Failed";
    PayloadTooLarge = 413, "Payload Too Large";
    UnsupportedMediaType = 415, "Unsupported Media Type";
    UnprocessableEntity = 422, "Unprocessable Entity";
    TooManyRequests = 429, "Too Many Requests";
    InternalServerError = 500, "Internal Server Error";
    NotImplemented = 501, "Not Implemented";
    ServiceUnavailable = 503, "Service Unavailable";
    GatewayTimeout = 504, "Gateway Timeout";
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.as_u16(), self.canonical_reason())
    }
}

impl From<StatusCode> for u16 {
    fn from(code: StatusCode) -> u16 {
        code.as_u16()
    }
}

/// An HTTP request method.
///
/// Routes are stored per method, so the router only ever answers for methods that
/// were registered explicitly: `HEAD` is never derived from `GET`.
///
/// # Examples
///
/// ```
/// use rttp_kernel::http::Method;
///
/// let method: Method = "GET".parse().unwrap();
/// assert_eq!(method, Method::Get);
/// assert_eq!(method.as_str(), "GET");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
    /// A method outside the set the router registers helpers for.
    Custom(String),
}

impl Method {
    /// Returns the method as a string slice.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Patch => "PATCH",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
            Self::Custom(s) => s.as_str(),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Method {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "GET" => Self::Get,
            "POST" => Self::Post,
            "PUT" => Self::Put,
            "DELETE" => Self::Delete,
            "PATCH" => Self::Patch,
            "HEAD" => Self::Head,
            "OPTIONS" => Self::Options,
            other => Self::Custom(other.to_owned()),
        })
    }
}

/// A value that is either a single item or, once the same name repeats, a list.
///
/// Multipart fields, uploaded files and query parameters all share this shape: the
/// first occurrence of a name is stored as [`OneOrMany::One`], the second promotes the
/// entry to [`OneOrMany::Many`], and later ones append.
///
/// # Examples
///
/// ```
/// use rttp_kernel::http::OneOrMany;
///
/// let mut value = OneOrMany::One("a");
/// value.push("b");
/// value.push("c");
/// assert_eq!(value.as_slice(), &["a", "b", "c"]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    /// Append `item`, promoting a single value to a list.
    pub fn push(&mut self, item: T) {
        let items = match std::mem::replace(self, Self::Many(Vec::new())) {
            Self::One(first) => vec![first, item],
            Self::Many(mut items) => {
                items.push(item);
                items
            }
        };
        *self = Self::Many(items);
    }

    /// The first value, whichever variant this is.
    pub fn first(&self) -> Option<&T> {
        self.as_slice().first()
    }

    /// All values in insertion order.
    pub fn as_slice(&self) -> &[T] {
        match self {
            Self::One(item) => std::slice::from_ref(item),
            Self::Many(items) => items,
        }
    }

    /// Number of values held.
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// Only an explicitly constructed empty `Many` is empty.
    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }

    /// Consume into a `Vec`, preserving order.
    pub fn into_vec(self) -> Vec<T> {
        match self {
            Self::One(item) => vec![item],
            Self::Many(items) => items,
        }
    }
}

/// Insert `value` under `key`, accumulating into a list when the key already exists.
pub fn insert_or_push<T>(
    map: &mut std::collections::HashMap<String, OneOrMany<T>>,
    key: String,
    value: T,
) {
    match map.get_mut(&key) {
        Some(existing) => existing.push(value),
        None => {
            map.insert(key, OneOrMany::One(value));
        }
    }
}

impl<T: serde::Serialize> serde::Serialize for OneOrMany<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::One(item) => item.serialize(serializer),
            Self::Many(items) => items.serialize(serializer),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn method_parse_known_and_custom() {
        assert_eq!("PATCH".parse::<Method>().unwrap(), Method::Patch);
        assert_eq!(
            "PURGE".parse::<Method>().unwrap(),
            Method::Custom("PURGE".to_owned())
        );
    }

    #[test]
    fn status_display() {
        assert_eq!(StatusCode::NotFound.to_string(), "404 Not Found");
        assert_eq!(u16::from(StatusCode::UnprocessableEntity), 422);
        assert_eq!(StatusCode::from_u16(204), Some(StatusCode::NoContent));
        assert_eq!(StatusCode::from_u16(418), None);
    }

    #[test]
    fn one_or_many_promotes_on_second_value() {
        let mut map = HashMap::new();
        insert_or_push(&mut map, "tag".to_owned(), "a".to_owned());
        assert_eq!(map["tag"], OneOrMany::One("a".to_owned()));

        insert_or_push(&mut map, "tag".to_owned(), "b".to_owned());
        insert_or_push(&mut map, "tag".to_owned(), "c".to_owned());
        assert_eq!(
            map["tag"],
            OneOrMany::Many(vec!["a".to_owned(), "b".to_owned(), "c".to_owned()])
        );
        assert_eq!(map["tag"].first().map(String::as_str), Some("a"));
    }

    #[test]
    fn one_or_many_serializes_flat() {
        let one = serde_json::to_value(OneOrMany::One("x")).unwrap();
        let many = serde_json::to_value(OneOrMany::Many(vec!["x", "y"])).unwrap();
        assert_eq!(one, serde_json::json!("x"));
        assert_eq!(many, serde_json::json!(["x", "y"]));
    }
}
