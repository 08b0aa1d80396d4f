//! Validated newtypes for the various names that cross a D-Bus API boundary.
//!
//! There is a maximum name length of 255 which applies to bus names,
//! interfaces, and members (D-Bus specification, "Valid Names").

use std::fmt;
use std::str::FromStr;

/// There is a maximum name length of 255 which applies to bus names,
/// interfaces, and members.
pub const MAX_NAME_LENGTH: usize = 255;

fn is_name_char(c: char) -> bool {
    matches!(c, 'A'..='Z' | 'a'..='z' | '0'..='9' | '_' | '-')
}

/// Interface names are composed of 1 or more elements separated by a period
/// ('.') character. All elements must contain at least one character and
/// must not begin with a digit.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InterfaceName(String);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InterfaceNameError {
    ExceedsMaxSize,
    ElementsMustContainChars,
    InvalidCharacter(char),
    MustContainPeriod,
    MustNotBeginWithPeriod,
    ElementMustNotBeginWithDigit,
}

impl fmt::Display for InterfaceNameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterfaceNameError::ExceedsMaxSize => write!(f, "exceeds maximum name length"),
            InterfaceNameError::ElementsMustContainChars => {
                write!(f, "elements must contain at least one character")
            }
            InterfaceNameError::InvalidCharacter(c) => write!(f, "invalid character '{}'", c),
            InterfaceNameError::MustContainPeriod => write!(f, "must contain a period"),
            InterfaceNameError::MustNotBeginWithPeriod => {
                write!(f, "must not begin with a period")
            }
            InterfaceNameError::ElementMustNotBeginWithDigit => {
                write!(f, "element must not begin with a digit")
            }
        }
    }
}

impl std::error::Error for InterfaceNameError {}

/// Shared validation for the element-separated-by-period grammar used by
/// interface names, well-known bus names, and error names.
fn validate_dotted_name(s: &str) -> Result<(), InterfaceNameError> {
    if s.len() > MAX_NAME_LENGTH {
        return Err(InterfaceNameError::ExceedsMaxSize);
    }
    if s.starts_with('.') {
        return Err(InterfaceNameError::MustNotBeginWithPeriod);
    }

    let mut saw_period = false;
    let mut element_start = 0usize;
    let mut element_len = 0usize;
    for (i, c) in s.char_indices() {
        if c == '.' {
            if element_len == 0 {
                return Err(InterfaceNameError::ElementsMustContainChars);
            }
            saw_period = true;
            element_start = i + 1;
            element_len = 0;
            continue;
        }
        if !is_name_char(c) {
            return Err(InterfaceNameError::InvalidCharacter(c));
        }
        if element_len == 0 && i == element_start && c.is_ascii_digit() {
            return Err(InterfaceNameError::ElementMustNotBeginWithDigit);
        }
        element_len += 1;
    }
    if element_len == 0 {
        return Err(InterfaceNameError::ElementsMustContainChars);
    }
    if !saw_period {
        return Err(InterfaceNameError::MustContainPeriod);
    }
    Ok(())
}

impl FromStr for InterfaceName {
    type Err = InterfaceNameError;
    fn from_str(s: &str) -> Result<InterfaceName, InterfaceNameError> {
        validate_dotted_name(s)?;
        Ok(InterfaceName(s.to_string()))
    }
}

impl fmt::Display for InterfaceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for InterfaceName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Connections have one or more bus names associated with them. A bus name
/// is of type STRING, meaning that it must be valid UTF-8. This type covers
/// well-known bus names (`com.example.Foo`); see [`UniqueName`] for the
/// `:N.M` form assigned by the daemon.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BusName(String);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BusNameError {
    ExceedsMaxSize,
    ElementsMustContainChars,
    InvalidCharacter(char),
    MustContainPeriod,
    MustNotBeginWithPeriod,
    ElementMustNotBeginWithDigit,
    IsUniqueName,
}

impl fmt::Display for BusNameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusNameError::ExceedsMaxSize => write!(f, "exceeds maximum name length"),
            BusNameError::ElementsMustContainChars => {
                write!(f, "elements must contain at least one character")
            }
            BusNameError::InvalidCharacter(c) => write!(f, "invalid character '{}'", c),
            BusNameError::MustContainPeriod => write!(f, "must contain a period"),
            BusNameError::MustNotBeginWithPeriod => write!(f, "must not begin with a period"),
            BusNameError::ElementMustNotBeginWithDigit => {
                write!(f, "element must not begin with a digit")
            }
            BusNameError::IsUniqueName => write!(f, "is a unique name, not a well-known name"),
        }
    }
}

impl std::error::Error for BusNameError {}

impl FromStr for BusName {
    type Err = BusNameError;
    fn from_str(s: &str) -> Result<BusName, BusNameError> {
        if s.starts_with(':') {
            return Err(BusNameError::IsUniqueName);
        }
        validate_dotted_name(s).map_err(|e| match e {
            InterfaceNameError::ExceedsMaxSize => BusNameError::ExceedsMaxSize,
            InterfaceNameError::ElementsMustContainChars => BusNameError::ElementsMustContainChars,
            InterfaceNameError::InvalidCharacter(c) => BusNameError::InvalidCharacter(c),
            InterfaceNameError::MustContainPeriod => BusNameError::MustContainPeriod,
            InterfaceNameError::MustNotBeginWithPeriod => BusNameError::MustNotBeginWithPeriod,
            InterfaceNameError::ElementMustNotBeginWithDigit => {
                BusNameError::ElementMustNotBeginWithDigit
            }
        })?;
        Ok(BusName(s.to_string()))
    }
}

impl fmt::Display for BusName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for BusName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The unique connection name the daemon assigns during `Hello`, of the form
/// `:N.M`. It remains with the connection for its entire lifetime and, unlike
/// well-known names, its elements are permitted to start with a digit.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UniqueName(String);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UniqueNameError {
    ExceedsMaxSize,
    MustBeginWithColon,
    ElementsMustContainChars,
    InvalidCharacter(char),
}

impl fmt::Display for UniqueNameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UniqueNameError::ExceedsMaxSize => write!(f, "exceeds maximum name length"),
            UniqueNameError::MustBeginWithColon => write!(f, "must begin with ':'"),
            UniqueNameError::ElementsMustContainChars => {
                write!(f, "elements must contain at least one character")
            }
            UniqueNameError::InvalidCharacter(c) => write!(f, "invalid character '{}'", c),
        }
    }
}

impl std::error::Error for UniqueNameError {}

impl FromStr for UniqueName {
    type Err = UniqueNameError;
    fn from_str(s: &str) -> Result<UniqueName, UniqueNameError> {
        if s.len() > MAX_NAME_LENGTH {
            return Err(UniqueNameError::ExceedsMaxSize);
        }
        let rest = s
            .strip_prefix(':')
            .ok_or(UniqueNameError::MustBeginWithColon)?;
        for element in rest.split('.') {
            if element.is_empty() {
                return Err(UniqueNameError::ElementsMustContainChars);
            }
            for c in element.chars() {
                if !is_name_char(c) {
                    return Err(UniqueNameError::InvalidCharacter(c));
                }
            }
        }
        Ok(UniqueName(s.to_string()))
    }
}

impl fmt::Display for UniqueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for UniqueName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A bus name, either well-known or the connection's unique name. Used where
/// the wire format doesn't distinguish the two (DESTINATION, SENDER).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BusOrUniqueName {
    WellKnown(BusName),
    Unique(UniqueName),
}

impl FromStr for BusOrUniqueName {
    type Err = BusNameError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.starts_with(':') {
            UniqueName::from_str(s)
                .map(BusOrUniqueName::Unique)
                .map_err(|_| BusNameError::InvalidCharacter(':'))
        } else {
            BusName::from_str(s).map(BusOrUniqueName::WellKnown)
        }
    }
}

impl fmt::Display for BusOrUniqueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusOrUniqueName::WellKnown(n) => write!(f, "{}", n),
            BusOrUniqueName::Unique(n) => write!(f, "{}", n),
        }
    }
}

impl AsRef<str> for BusOrUniqueName {
    fn as_ref(&self) -> &str {
        match self {
            BusOrUniqueName::WellKnown(n) => n.as_ref(),
            BusOrUniqueName::Unique(n) => n.as_ref(),
        }
    }
}

/// The member, either the method name or signal name. Unlike interface and
/// bus names, members contain no periods.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemberName(String);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MemberNameError {
    ExceedsMaxSize,
    Empty,
    InvalidCharacter(char),
    MustNotContainPeriod,
    MustNotBeginWithDigit,
}

impl fmt::Display for MemberNameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemberNameError::ExceedsMaxSize => write!(f, "exceeds maximum name length"),
            MemberNameError::Empty => write!(f, "must not be empty"),
            MemberNameError::InvalidCharacter(c) => write!(f, "invalid character '{}'", c),
            MemberNameError::MustNotContainPeriod => write!(f, "must not contain a period"),
            MemberNameError::MustNotBeginWithDigit => write!(f, "must not begin with a digit"),
        }
    }
}

impl std::error::Error for MemberNameError {}

impl FromStr for MemberName {
    type Err = MemberNameError;
    fn from_str(s: &str) -> Result<MemberName, MemberNameError> {
        if s.is_empty() {
            return Err(MemberNameError::Empty);
        }
        if s.len() > MAX_NAME_LENGTH {
            return Err(MemberNameError::ExceedsMaxSize);
        }
        if s.starts_with(|c: char| c.is_ascii_digit()) {
            return Err(MemberNameError::MustNotBeginWithDigit);
        }
        for c in s.chars() {
            if c == '.' {
                return Err(MemberNameError::MustNotContainPeriod);
            }
            if !is_name_char(c) {
                return Err(MemberNameError::InvalidCharacter(c));
            }
        }
        Ok(MemberName(s.to_string()))
    }
}

impl fmt::Display for MemberName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for MemberName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The name of an error that occurred, carried in the ERROR_NAME header
/// field. Error names use the same dotted grammar as interface names.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ErrorName(String);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorNameError {
    ExceedsMaxSize,
    ElementsMustContainChars,
    InvalidCharacter(char),
    MustContainPeriod,
    MustNotBeginWithPeriod,
    ElementMustNotBeginWithDigit,
}

impl fmt::Display for ErrorNameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorNameError::ExceedsMaxSize => write!(f, "exceeds maximum name length"),
            ErrorNameError::ElementsMustContainChars => {
                write!(f, "elements must contain at least one character")
            }
            ErrorNameError::InvalidCharacter(c) => write!(f, "invalid character '{}'", c),
            ErrorNameError::MustContainPeriod => write!(f, "must contain a period"),
            ErrorNameError::MustNotBeginWithPeriod => write!(f, "must not begin with a period"),
            ErrorNameError::ElementMustNotBeginWithDigit => {
                write!(f, "element must not begin with a digit")
            }
        }
    }
}

impl std::error::Error for ErrorNameError {}

impl FromStr for ErrorName {
    type Err = ErrorNameError;
    fn from_str(s: &str) -> Result<ErrorName, ErrorNameError> {
        validate_dotted_name(s).map_err(|e| match e {
            InterfaceNameError::ExceedsMaxSize => ErrorNameError::ExceedsMaxSize,
            InterfaceNameError::ElementsMustContainChars => {
                ErrorNameError::ElementsMustContainChars
            }
            InterfaceNameError::InvalidCharacter(c) => ErrorNameError::InvalidCharacter(c),
            InterfaceNameError::MustContainPeriod => ErrorNameError::MustContainPeriod,
            InterfaceNameError::MustNotBeginWithPeriod => ErrorNameError::MustNotBeginWithPeriod,
            InterfaceNameError::ElementMustNotBeginWithDigit => {
                ErrorNameError::ElementMustNotBeginWithDigit
            }
        })?;
        Ok(ErrorName(s.to_string()))
    }
}

impl fmt::Display for ErrorName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ErrorName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

lazy_static::lazy_static! {
    /// `org.freedesktop.DBus.Error.Failed`, the default error name used when
    /// a method handler fails without declaring a more specific one.
    pub static ref FAILED_ERROR_NAME: ErrorName =
        ErrorName::from_str("org.freedesktop.DBus.Error.Failed").unwrap();
    pub static ref UNKNOWN_OBJECT_ERROR_NAME: ErrorName =
        ErrorName::from_str("org.freedesktop.DBus.Error.UnknownObject").unwrap();
    pub static ref UNKNOWN_INTERFACE_ERROR_NAME: ErrorName =
        ErrorName::from_str("org.freedesktop.DBus.Error.UnknownInterface").unwrap();
    pub static ref UNKNOWN_METHOD_ERROR_NAME: ErrorName =
        ErrorName::from_str("org.freedesktop.DBus.Error.UnknownMethod").unwrap();
    pub static ref UNKNOWN_PROPERTY_ERROR_NAME: ErrorName =
        ErrorName::from_str("org.freedesktop.DBus.Error.UnknownProperty").unwrap();
    pub static ref INVALID_ARGS_ERROR_NAME: ErrorName =
        ErrorName::from_str("org.freedesktop.DBus.Error.InvalidArgs").unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interface_name() {
        let large_string = String::from_utf8(vec![b'X'; 256]).unwrap();
        assert_eq!(
            Err(InterfaceNameError::ExceedsMaxSize),
            InterfaceName::from_str(large_string.as_str())
        );

        assert_eq!(
            Err(InterfaceNameError::ElementsMustContainChars),
            InterfaceName::from_str("Elements..MissingChars")
        );

        assert_eq!(
            Err(InterfaceNameError::MustContainPeriod),
            InterfaceName::from_str("MissingPeriod")
        );

        assert_eq!(
            Err(InterfaceNameError::MustNotBeginWithPeriod),
            InterfaceName::from_str(".Must.Not.Start.With.Period")
        );

        assert_eq!(
            Err(InterfaceNameError::ElementMustNotBeginWithDigit),
            InterfaceName::from_str("Must.Not.Start.With.9Digit")
        );

        assert_eq!(
            Err(InterfaceNameError::InvalidCharacter('|')),
            InterfaceName::from_str("Invalid.C|har")
        );

        let valid_string = "org.freedesktop.DBus";
        assert_eq!(
            Ok(InterfaceName(valid_string.to_string())),
            InterfaceName::from_str(valid_string)
        );
    }

    #[test]
    fn bus_name() {
        let large_string = String::from_utf8(vec![b'X'; 256]).unwrap();
        assert_eq!(
            Err(BusNameError::ExceedsMaxSize),
            BusName::from_str(large_string.as_str())
        );

        assert_eq!(
            Err(BusNameError::MustContainPeriod),
            BusName::from_str("MissingPeriod")
        );

        assert_eq!(Err(BusNameError::IsUniqueName), BusName::from_str(":1.5"));

        let valid_string = "com.example.MusicPlayer1";
        assert_eq!(
            Ok(BusName(valid_string.to_string())),
            BusName::from_str(valid_string)
        );
    }

    #[test]
    fn unique_name() {
        assert_eq!(
            Err(UniqueNameError::MustBeginWithColon),
            UniqueName::from_str("1.5")
        );
        assert_eq!(
            Ok(UniqueName(":1.5".to_string())),
            UniqueName::from_str(":1.5")
        );
        assert_eq!(
            Ok(UniqueName(":1.200".to_string())),
            UniqueName::from_str(":1.200")
        );
    }

    #[test]
    fn member_name() {
        let large_string = String::from_utf8(vec![b'X'; 256]).unwrap();
        assert_eq!(
            Err(MemberNameError::ExceedsMaxSize),
            MemberName::from_str(large_string.as_str())
        );

        assert_eq!(
            Err(MemberNameError::InvalidCharacter('|')),
            MemberName::from_str("InvalidC|har")
        );

        assert_eq!(
            Err(MemberNameError::MustNotContainPeriod),
            MemberName::from_str("Contains.Period")
        );

        assert_eq!(
            Err(MemberNameError::MustNotBeginWithDigit),
            MemberName::from_str("1MustNotBeginWithDigit")
        );

        assert_eq!(Err(MemberNameError::Empty), MemberName::from_str(""));

        let valid_string = "RequestName";
        assert_eq!(
            Ok(MemberName(valid_string.to_string())),
            MemberName::from_str(valid_string)
        );
    }

    #[test]
    fn error_name() {
        assert_eq!(
            Err(ErrorNameError::MustContainPeriod),
            ErrorName::from_str("MissingPeriod")
        );

        let valid_string = "org.freedesktop.DBus.Error.Failed";
        assert_eq!(
            Ok(ErrorName(valid_string.to_string())),
            ErrorName::from_str(valid_string)
        );
    }
}
