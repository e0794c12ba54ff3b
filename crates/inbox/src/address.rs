use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ensure};

use crate::error::{InboxError, InboxResult, InvalidAddressSnafu, ResolutionFailedSnafu};
use crate::sdk::NameResolver;

/// Suffix that marks input as a human-readable name rather than a raw address.
pub const NAME_SUFFIX: &str = ".eth";

const ADDRESS_HEX_LEN: usize = 40;

/// Canonical network address: `0x` followed by 40 lowercase hex digits.
///
/// Parsing lowercases the input, so equality is case-insensitive with respect to
/// whatever the user or SDK originally supplied.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    pub fn parse(raw: &str) -> InboxResult<Self> {
        let trimmed = raw.trim();
        ensure!(
            is_canonical_address(trimmed),
            InvalidAddressSnafu {
                stage: "parse-address",
                input: raw.to_string(),
            }
        );
        Ok(Self(trimmed.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Compact `0x1234...abcd` form for list rows.
    pub fn abbreviated(&self) -> String {
        format!(
            "{}...{}",
            &self.0[..6],
            &self.0[self.0.len() - 4..]
        )
    }

    /// Case-insensitive substring match used by the conversation search box.
    pub fn contains_ignore_case(&self, needle: &str) -> bool {
        self.0.contains(&needle.to_ascii_lowercase())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

impl FromStr for Address {
    type Err = InboxError;

    fn from_str(raw: &str) -> InboxResult<Self> {
        Self::parse(raw)
    }
}

impl TryFrom<String> for Address {
    type Error = InboxError;

    fn try_from(value: String) -> InboxResult<Self> {
        Self::parse(&value)
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.0
    }
}

impl AsRef<str> for Address {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Returns true for strict 20-byte addresses in `0x`-prefixed hex, any case.
pub fn is_canonical_address(value: &str) -> bool {
    let Some(hex_digits) = value.strip_prefix("0x") else {
        return false;
    };
    hex_digits.len() == ADDRESS_HEX_LEN && hex_digits.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Returns true when the input looks like a resolvable name (`alice.eth`).
pub fn is_name(value: &str) -> bool {
    let value = value.trim();
    value.len() > NAME_SUFFIX.len() && value.to_ascii_lowercase().ends_with(NAME_SUFFIX)
}

/// Identifies one resolution request. Only the most recently issued ticket may
/// commit its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResolutionTicket(u64);

impl ResolutionTicket {
    pub const fn raw(&self) -> u64 {
        self.0
    }
}

/// Turns user input into a canonical [`Address`], deferring names to an external
/// resolver.
#[derive(Clone)]
pub struct AddressResolver {
    names: Arc<dyn NameResolver>,
    latest: Arc<AtomicU64>,
}

impl AddressResolver {
    pub fn new(names: Arc<dyn NameResolver>) -> Self {
        Self {
            names,
            latest: Arc::new(AtomicU64::new(0)),
        }
    }

    pub async fn resolve(&self, input: &str) -> InboxResult<Address> {
        let input = input.trim();
        if is_canonical_address(input) {
            return Address::parse(input);
        }

        ensure!(
            is_name(input),
            InvalidAddressSnafu {
                stage: "resolve-classify-input",
                input: input.to_string(),
            }
        );

        let resolved = self
            .names
            .resolve_name(input)
            .await
            .map_err(|source| InboxError::ResolutionFailed {
                stage: "resolve-name-provider",
                name: input.to_string(),
                details: source.to_string(),
            })?
            .context(ResolutionFailedSnafu {
                stage: "resolve-name-empty",
                name: input.to_string(),
                details: "name has no address record".to_string(),
            })?;

        tracing::debug!(name = input, address = %resolved, "resolved name");
        Ok(resolved)
    }

    /// Issues a new ticket, superseding every earlier one.
    pub fn issue(&self) -> ResolutionTicket {
        ResolutionTicket(self.latest.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn is_current(&self, ticket: ResolutionTicket) -> bool {
        self.latest.load(Ordering::SeqCst) == ticket.0
    }
}

impl fmt::Debug for AddressResolver {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("AddressResolver")
            .field("latest", &self.latest.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::StaticNameResolver;

    const ALICE: &str = "0xabcdefabcdefabcdefabcdefabcdefabcdef1234";

    fn resolver(names: StaticNameResolver) -> AddressResolver {
        AddressResolver::new(Arc::new(names))
    }

    #[test]
    fn canonical_pattern_requires_prefix_and_forty_hex_digits() {
        assert!(is_canonical_address(ALICE));
        assert!(is_canonical_address("0xABCDEFabcdefABCDEFabcdefABCDEFabcdef1234"));
        assert!(!is_canonical_address("abcdefabcdefabcdefabcdefabcdefabcdef123456"));
        assert!(!is_canonical_address("0xabc"));
        assert!(!is_canonical_address("0xgbcdefabcdefabcdefabcdefabcdefabcdef1234"));
        assert!(!is_canonical_address("0xabcdefabcdefabcdefabcdefabcdefabcdef12345"));
    }

    #[test]
    fn parse_lowercases_so_equality_ignores_case() {
        let upper = Address::parse("0xABCDEFABCDEFABCDEFABCDEFABCDEFABCDEF1234").unwrap();
        let lower = Address::parse(ALICE).unwrap();
        assert_eq!(upper, lower);
        assert_eq!(upper.as_str(), ALICE);
    }

    #[test]
    fn abbreviated_keeps_prefix_and_tail() {
        let address = Address::parse(ALICE).unwrap();
        assert_eq!(address.abbreviated(), "0xabcd...1234");
    }

    #[test]
    fn names_need_the_suffix_and_a_label() {
        assert!(is_name("bob.eth"));
        assert!(is_name("Bob.ETH"));
        assert!(!is_name(".eth"));
        assert!(!is_name("bob.com"));
    }

    #[tokio::test]
    async fn canonical_input_skips_the_name_provider() {
        let resolver = resolver(StaticNameResolver::failing());
        let resolved = resolver.resolve(ALICE).await.unwrap();
        assert_eq!(resolved.as_str(), ALICE);
    }

    #[tokio::test]
    async fn names_are_resolved_through_the_provider() {
        let bob = Address::parse("0xdef0000000000000000000000000000000000456").unwrap();
        let resolver = resolver(StaticNameResolver::new().with_name("bob.eth", bob.clone()));
        assert_eq!(resolver.resolve("bob.eth").await.unwrap(), bob);
    }

    #[tokio::test]
    async fn missing_or_failing_names_fail_resolution() {
        let empty = resolver(StaticNameResolver::new());
        let error = empty.resolve("ghost.eth").await.unwrap_err();
        assert!(matches!(error, InboxError::ResolutionFailed { .. }));
        assert!(error.is_invalid_address());

        let failing = resolver(StaticNameResolver::failing());
        let error = failing.resolve("bob.eth").await.unwrap_err();
        assert!(matches!(error, InboxError::ResolutionFailed { .. }));
    }

    #[tokio::test]
    async fn other_input_is_an_invalid_address() {
        let resolver = resolver(StaticNameResolver::new());
        let error = resolver.resolve("not an address").await.unwrap_err();
        assert!(matches!(error, InboxError::InvalidAddress { .. }));
    }

    #[test]
    fn newer_tickets_supersede_older_ones() {
        let resolver = resolver(StaticNameResolver::new());
        let first = resolver.issue();
        assert!(resolver.is_current(first));

        let second = resolver.issue();
        assert!(!resolver.is_current(first));
        assert!(resolver.is_current(second));
    }
}
