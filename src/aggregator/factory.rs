//! Compiles textual field specifications into a [`View`].
//!
//! Key tokens:
//!
//! - `<element>` or `<alias>` or `<pen>:<id>`
//! - `<field>/<prefix>` masks an address to a subnet
//! - `timewindow(<field>, <N>[s|m|h])` rounds a timestamp down
//! - `direction`, `dir` or `biflowdir` for the biflow half
//!
//! Value tokens are `[sum|min|max](<[in |out ]field>)`; a bare numeric field
//! is summed. `flows`, `flowcount` and `count` count records.
//!
//! Order tokens are `<name>[/asc|/desc]` and default to descending.

use super::error::ViewError;
use super::field::{
    AggregatedField, AliasField, DirectField, Field, InOutKeyField, InOutValueField, SubnetField,
    TimeWindowField, ViewDirection,
};
use super::view::{OrderDirection, OrderField, View};
use crate::ipfix::element::Registry;

/// Key fields that get an in/out counterpart when a view folds both
/// directions: `(name, in, out)`.
const INOUT_KEYS: &[(&str, &str, &str)] = &[
    ("ip", "dstip", "srcip"),
    ("ip4", "destinationIPv4Address", "sourceIPv4Address"),
    ("ip6", "destinationIPv6Address", "sourceIPv6Address"),
    ("port", "dstport", "srcport"),
];

/// Builds views against an element registry.
pub struct ViewFactory<'r> {
    registry: &'r Registry,
}

impl<'r> ViewFactory<'r> {
    pub fn new(registry: &'r Registry) -> Self {
        Self { registry }
    }

    /// Compiles comma-separated key, value and order specifications.
    pub fn create_view(&self, keys: &str, values: &str, order: &str) -> Result<View, ViewError> {
        let key_defs = split_args(keys);
        if key_defs.is_empty() {
            return Err(ViewError::EmptyDefinition);
        }

        let mut value_fields = Vec::new();
        for def in split_args(values) {
            let field = self.create_value_field(def)?;
            value_fields.push((def.to_string(), field));
        }
        let has_inout = value_fields
            .iter()
            .any(|(_, f)| matches!(f, Field::InOutValue(_)));

        let mut key_fields = Vec::with_capacity(key_defs.len());
        for def in key_defs {
            let mut field = self.create_key_field(def)?;
            if has_inout {
                if let Some(replacement) = self.inout_counterpart(&field)? {
                    field = replacement;
                }
            }
            key_fields.push((def.to_string(), field));
        }

        let mut view = View::new(key_fields, value_fields);

        let mut order_fields = Vec::new();
        for def in split_args(order) {
            order_fields.push(parse_order(&view, def)?);
        }
        view.set_order(order_fields);

        Ok(view)
    }

    /// Resolves a key token.
    pub fn create_key_field(&self, def: &str) -> Result<Field, ViewError> {
        let def = def.trim();
        if def.is_empty() {
            return Err(ViewError::EmptyDefinition);
        }

        if let Some((func, args)) = parse_call(def) {
            if !func.eq_ignore_ascii_case("timewindow") {
                return Err(ViewError::InvalidFunction {
                    func: func.to_string(),
                    def: def.to_string(),
                });
            }
            let args = split_args(args);
            let [source, window] = args.as_slice() else {
                return Err(ViewError::InvalidArguments {
                    def: def.to_string(),
                    reason: "expected a field and a window size".into(),
                });
            };
            let source = self.create_key_field(source)?;
            let window_ms = parse_window(window).ok_or_else(|| ViewError::InvalidArguments {
                def: def.to_string(),
                reason: format!("invalid window size \"{window}\""),
            })?;
            return TimeWindowField::new(source, window_ms).map(Field::TimeWindow);
        }

        if let Some((name, prefix)) = def.rsplit_once('/') {
            let prefix_len: u8 = prefix
                .trim()
                .parse()
                .map_err(|_| ViewError::InvalidArguments {
                    def: def.to_string(),
                    reason: format!("invalid prefix length \"{prefix}\""),
                })?;
            let source = self.create_key_field(name)?;
            return SubnetField::new(source, prefix_len).map(Field::Subnet);
        }

        match def {
            "direction" | "dir" | "biflowdir" => Ok(Field::Direction),
            name => self.create_element_field(name),
        }
    }

    /// Resolves a value token.
    pub fn create_value_field(&self, def: &str) -> Result<Field, ViewError> {
        let def = def.trim();
        if def.is_empty() {
            return Err(ViewError::EmptyDefinition);
        }

        let (func, inner) = match parse_call(def) {
            Some((func, args)) => (Some(func), args.trim()),
            None => (None, def),
        };

        let (dir, name) = strip_direction(inner);
        let source = match name {
            "flows" | "flowcount" | "count" => Field::FlowCount,
            name => self.create_element_field(name)?,
        };

        let field = match func.map(str::to_ascii_lowercase).as_deref() {
            Some("sum") => AggregatedField::sum(source)?,
            Some("min") => AggregatedField::min(source)?,
            Some("max") => AggregatedField::max(source)?,
            None if source.data_type().is_number() => AggregatedField::sum(source)?,
            None => return Err(ViewError::InvalidAggregate(def.to_string())),
            Some(_) => {
                return Err(ViewError::InvalidFunction {
                    func: func.unwrap_or_default().to_string(),
                    def: def.to_string(),
                })
            }
        };

        Ok(match dir {
            ViewDirection::None => field,
            dir => Field::InOutValue(InOutValueField::new(field, dir)),
        })
    }

    /// Looks up an element by name, then an alias, then a `pen:id` reference.
    fn create_element_field(&self, name: &str) -> Result<Field, ViewError> {
        if let Some(elem) = self.registry.find_name(name) {
            return DirectField::new(elem).map(Field::Direct);
        }
        if let Some(alias) = self.registry.find_alias(name) {
            return AliasField::new(alias, self.registry).map(Field::Alias);
        }
        if let Some(elem) = self.registry.find_ref(name) {
            return DirectField::new(elem).map(Field::Direct);
        }
        Err(ViewError::UnknownField(name.to_string()))
    }

    /// Returns the in/out variant of a key field, if it has one.
    fn inout_counterpart(&self, field: &Field) -> Result<Option<Field>, ViewError> {
        if let Field::Subnet(subnet) = field {
            return match self.inout_counterpart(subnet.source())? {
                Some(inner) => {
                    SubnetField::new(inner, subnet.prefix_len()).map(|s| Some(Field::Subnet(s)))
                }
                None => Ok(None),
            };
        }

        for &(name, in_name, out_name) in INOUT_KEYS {
            let Ok(candidate) = self.create_element_field(name) else {
                continue;
            };
            if candidate != *field {
                continue;
            }
            let in_field = self.create_element_field(in_name)?;
            let out_field = self.create_element_field(out_name)?;
            return InOutKeyField::new(in_field, out_field).map(|f| Some(Field::InOutKey(f)));
        }

        Ok(None)
    }
}

/// Splits on commas outside parentheses, trimming each part.
fn split_args(s: &str) -> Vec<&str> {
    if s.trim().is_empty() {
        return Vec::new();
    }

    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(s[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(s[start..].trim());
    parts
}

/// Splits `name(args)` into its parts.
fn parse_call(def: &str) -> Option<(&str, &str)> {
    let inner = def.strip_suffix(')')?;
    let (func, args) = inner.split_once('(')?;
    let func = func.trim();
    if func.is_empty() || !func.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    Some((func, args))
}

/// Window size in milliseconds from `N`, `Ns`, `Nm` or `Nh`.
fn parse_window(s: &str) -> Option<u64> {
    let s = s.trim();
    let (digits, unit_ms) = match s.as_bytes().last()? {
        b's' => (&s[..s.len() - 1], 1_000),
        b'm' => (&s[..s.len() - 1], 60_000),
        b'h' => (&s[..s.len() - 1], 3_600_000),
        _ => (s, 1_000),
    };
    digits.trim().parse::<u64>().ok()?.checked_mul(unit_ms)
}

fn strip_direction(name: &str) -> (ViewDirection, &str) {
    if let Some(rest) = name.strip_prefix("in ") {
        (ViewDirection::In, rest.trim())
    } else if let Some(rest) = name.strip_prefix("out ") {
        (ViewDirection::Out, rest.trim())
    } else {
        (ViewDirection::None, name)
    }
}

fn parse_order(view: &View, def: &str) -> Result<OrderField, ViewError> {
    let (name, dir) = match def.rsplit_once('/') {
        Some((name, suffix)) => match suffix.trim().to_ascii_lowercase().as_str() {
            "asc" => (name.trim(), OrderDirection::Ascending),
            "desc" => (name.trim(), OrderDirection::Descending),
            // Subnet key such as `srcip/24`.
            s if s.chars().all(|c| c.is_ascii_digit()) => (def, OrderDirection::Descending),
            _ => return Err(ViewError::InvalidOrderDirection(def.to_string())),
        },
        None => (def, OrderDirection::Descending),
    };

    let index = view
        .find_field(name)
        .ok_or_else(|| ViewError::UnknownOrderField(name.to_string()))?;
    Ok(OrderField { index, dir })
}
