use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Errors arising from parsing a resource URI.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum UriError {
    #[error("URI '{0}' has no recognized scheme (expected redb://, template:// or stream://)")]
    UnknownScheme(String),
    #[error("URI has {actual} path segments where {expected} are required")]
    SegmentCount {
        expected: &'static str,
        actual: usize,
    },
    #[error("URI segment may not be empty")]
    EmptySegment,
    #[error("unterminated quoted URI segment")]
    UnterminatedQuote,
    #[error("unknown container type '{0}'")]
    UnknownContainerType(String),
    #[error("unknown item type '{0}'")]
    UnknownItemType(String),
    #[error("template URI namespace may not be empty")]
    EmptyNamespace,
    #[error("template URI requires a literal 'database' segment, found '{0}'")]
    BadTemplateMarker(String),
}

/// The kind of schema object a container URI names.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ContainerType {
    Table,
    Collection,
    View,
    MaterializedView,
    GraphNode,
    GraphEdge,
    Topic,
    Stream,
}

impl ContainerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Table => "table",
            Self::Collection => "collection",
            Self::View => "view",
            Self::MaterializedView => "materialized_view",
            Self::GraphNode => "graph_node",
            Self::GraphEdge => "graph_edge",
            Self::Topic => "topic",
            Self::Stream => "stream",
        }
    }

    pub const ALL: [ContainerType; 8] = [
        Self::Table,
        Self::Collection,
        Self::View,
        Self::MaterializedView,
        Self::GraphNode,
        Self::GraphEdge,
        Self::Topic,
        Self::Stream,
    ];
}

impl FromStr for ContainerType {
    type Err = UriError;

    fn from_str(s: &str) -> Result<Self, UriError> {
        Ok(match s {
            "table" => Self::Table,
            "collection" => Self::Collection,
            "view" => Self::View,
            "materialized_view" => Self::MaterializedView,
            "graph_node" => Self::GraphNode,
            "graph_edge" => Self::GraphEdge,
            "topic" => Self::Topic,
            "stream" => Self::Stream,
            other => return Err(UriError::UnknownContainerType(other.to_string())),
        })
    }
}

impl fmt::Display for ContainerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The kind of container child an item URI names.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    Column,
    Field,
    Property,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Column => "column",
            Self::Field => "field",
            Self::Property => "property",
        }
    }
}

impl FromStr for ItemType {
    type Err = UriError;

    fn from_str(s: &str) -> Result<Self, UriError> {
        Ok(match s {
            "column" => Self::Column,
            "field" => Self::Field,
            "property" => Self::Property,
            other => return Err(UriError::UnknownItemType(other.to_string())),
        })
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `redb://` URI naming a container or item of a real database.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StoreUri {
    pub database_id: String,
    pub db_name: String,
    pub container_type: ContainerType,
    pub container_name: String,
    pub item: Option<(ItemType, String)>,
}

/// A `template://` URI naming a virtual container or item,
/// matched by name against real stores at reconciliation time.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TemplateUri {
    pub namespace: String,
    pub container_type: ContainerType,
    pub container_name: String,
    pub item: Option<(ItemType, String)>,
}

/// A `stream://` URI naming a stream-platform topic.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamUri {
    pub workspace_id: String,
    pub platform: String,
    pub integration_name: String,
    pub topic_name: String,
}

/// A stable, globally unique identifier of a resource.
/// URIs are parsed and generated bit-exact: `parse(generate(u)) == u`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceUri {
    Store(StoreUri),
    Template(TemplateUri),
    Stream(StreamUri),
}

impl StoreUri {
    pub fn container(
        database_id: impl Into<String>,
        db_name: impl Into<String>,
        container_type: ContainerType,
        container_name: impl Into<String>,
    ) -> Self {
        Self {
            database_id: database_id.into(),
            db_name: db_name.into(),
            container_type,
            container_name: container_name.into(),
            item: None,
        }
    }

    pub fn with_item(mut self, item_type: ItemType, item_name: impl Into<String>) -> Self {
        self.item = Some((item_type, item_name.into()));
        self
    }
}

impl TemplateUri {
    pub fn container(
        namespace: impl Into<String>,
        container_type: ContainerType,
        container_name: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            container_type,
            container_name: container_name.into(),
            item: None,
        }
    }

    pub fn with_item(mut self, item_type: ItemType, item_name: impl Into<String>) -> Self {
        self.item = Some((item_type, item_name.into()));
        self
    }
}

impl ResourceUri {
    /// The name of the container this URI addresses (or belongs to).
    pub fn container_name(&self) -> Option<&str> {
        match self {
            Self::Store(u) => Some(&u.container_name),
            Self::Template(u) => Some(&u.container_name),
            Self::Stream(u) => Some(&u.topic_name),
        }
    }

    /// The item name, if this URI addresses an item rather than a container.
    pub fn item_name(&self) -> Option<&str> {
        match self {
            Self::Store(u) => u.item.as_ref().map(|(_, n)| n.as_str()),
            Self::Template(u) => u.item.as_ref().map(|(_, n)| n.as_str()),
            Self::Stream(_) => None,
        }
    }

    pub fn is_template(&self) -> bool {
        matches!(self, Self::Template(_))
    }

    /// The URI of the enclosing container: identity for container URIs,
    /// the item segments stripped for item URIs.
    pub fn container_uri(&self) -> ResourceUri {
        match self {
            Self::Store(u) => Self::Store(StoreUri {
                item: None,
                ..u.clone()
            }),
            Self::Template(u) => Self::Template(TemplateUri {
                item: None,
                ..u.clone()
            }),
            Self::Stream(u) => Self::Stream(u.clone()),
        }
    }
}

// Segments which contain a slash, quote-ambiguous leading character,
// or whitespace are wrapped in double quotes on generation. Parsing
// accepts both quoted and unquoted forms.
fn needs_quoting(s: &str) -> bool {
    s.contains('/') || s.contains(char::is_whitespace) || s.starts_with('"')
}

fn write_segment(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    if needs_quoting(s) {
        write!(f, "\"{s}\"")
    } else {
        f.write_str(s)
    }
}

impl fmt::Display for ResourceUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store(u) => {
                f.write_str("redb://")?;
                write_segment(f, &u.database_id)?;
                f.write_str("/")?;
                write_segment(f, &u.db_name)?;
                write!(f, "/{}/", u.container_type)?;
                write_segment(f, &u.container_name)?;
                if let Some((item_type, item_name)) = &u.item {
                    write!(f, "/{item_type}/")?;
                    write_segment(f, item_name)?;
                }
                Ok(())
            }
            Self::Template(u) => {
                f.write_str("template://")?;
                write_segment(f, &u.namespace)?;
                write!(f, "/database/{}/", u.container_type)?;
                write_segment(f, &u.container_name)?;
                if let Some((item_type, item_name)) = &u.item {
                    write!(f, "/{item_type}/")?;
                    write_segment(f, item_name)?;
                }
                Ok(())
            }
            Self::Stream(u) => {
                f.write_str("stream://")?;
                write_segment(f, &u.workspace_id)?;
                f.write_str("/")?;
                write_segment(f, &u.platform)?;
                f.write_str("/")?;
                write_segment(f, &u.integration_name)?;
                f.write_str("/")?;
                write_segment(f, &u.topic_name)?;
                Ok(())
            }
        }
    }
}

/// Split the path portion of a URI into segments, honoring double-quoted
/// segments whose names may embed slashes.
fn split_segments(path: &str) -> Result<Vec<String>, UriError> {
    let mut segments = Vec::new();
    let mut chars = path.chars().peekable();

    loop {
        let mut segment = String::new();

        if chars.peek() == Some(&'"') {
            chars.next();
            let mut closed = false;
            for c in chars.by_ref() {
                if c == '"' {
                    closed = true;
                    break;
                }
                segment.push(c);
            }
            if !closed {
                return Err(UriError::UnterminatedQuote);
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c == '/' {
                    break;
                }
                segment.push(c);
                chars.next();
            }
        }
        segments.push(segment);

        match chars.next() {
            None => break,
            Some('/') => continue,
            // A quoted segment must be followed by a separator or the end.
            Some(_) => return Err(UriError::UnterminatedQuote),
        }
    }
    Ok(segments)
}

impl FromStr for ResourceUri {
    type Err = UriError;

    fn from_str(s: &str) -> Result<Self, UriError> {
        let (scheme, rest) = match s.split_once("://") {
            Some(parts) => parts,
            None => return Err(UriError::UnknownScheme(s.to_string())),
        };
        let segments = split_segments(rest)?;

        match scheme {
            "redb" => {
                if segments.len() != 4 && segments.len() != 6 {
                    return Err(UriError::SegmentCount {
                        expected: "4 or 6",
                        actual: segments.len(),
                    });
                }
                require_non_empty(&segments)?;
                let item = parse_item(&segments)?;
                Ok(Self::Store(StoreUri {
                    database_id: segments[0].clone(),
                    db_name: segments[1].clone(),
                    container_type: segments[2].parse()?,
                    container_name: segments[3].clone(),
                    item,
                }))
            }
            "template" => {
                if segments.len() != 4 && segments.len() != 6 {
                    return Err(UriError::SegmentCount {
                        expected: "4 or 6",
                        actual: segments.len(),
                    });
                }
                if segments[0].is_empty() {
                    return Err(UriError::EmptyNamespace);
                }
                require_non_empty(&segments)?;
                if segments[1] != "database" {
                    return Err(UriError::BadTemplateMarker(segments[1].clone()));
                }
                let item = parse_item(&segments)?;
                Ok(Self::Template(TemplateUri {
                    namespace: segments[0].clone(),
                    container_type: segments[2].parse()?,
                    container_name: segments[3].clone(),
                    item,
                }))
            }
            "stream" => {
                if segments.len() != 4 {
                    return Err(UriError::SegmentCount {
                        expected: "4",
                        actual: segments.len(),
                    });
                }
                require_non_empty(&segments)?;
                Ok(Self::Stream(StreamUri {
                    workspace_id: segments[0].clone(),
                    platform: segments[1].clone(),
                    integration_name: segments[2].clone(),
                    topic_name: segments[3].clone(),
                }))
            }
            _ => Err(UriError::UnknownScheme(s.to_string())),
        }
    }
}

fn require_non_empty(segments: &[String]) -> Result<(), UriError> {
    if segments.iter().any(|s| s.is_empty()) {
        return Err(UriError::EmptySegment);
    }
    Ok(())
}

fn parse_item(segments: &[String]) -> Result<Option<(ItemType, String)>, UriError> {
    if segments.len() == 6 {
        Ok(Some((segments[4].parse()?, segments[5].clone())))
    } else {
        Ok(None)
    }
}

impl Serialize for ResourceUri {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ResourceUri {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn store_uri_round_trips_for_every_container_type() {
        for ct in ContainerType::ALL {
            let uri = ResourceUri::Store(
                StoreUri::container("db-1", "appdb", ct, "orders")
                    .with_item(ItemType::Column, "id"),
            );
            let text = uri.to_string();
            assert_eq!(text.parse::<ResourceUri>().unwrap(), uri, "uri: {text}");

            let container = uri.container_uri();
            let text = container.to_string();
            assert_eq!(text.parse::<ResourceUri>().unwrap(), container);
        }
    }

    #[test]
    fn parses_container_and_item_forms() {
        let uri: ResourceUri = "redb://db-1/appdb/table/orders".parse().unwrap();
        assert_eq!(uri.container_name(), Some("orders"));
        assert_eq!(uri.item_name(), None);

        let uri: ResourceUri = "redb://db-1/appdb/table/orders/column/id".parse().unwrap();
        assert_eq!(uri.item_name(), Some("id"));
        assert_eq!(uri.container_uri().to_string(), "redb://db-1/appdb/table/orders");
    }

    #[test]
    fn accepts_quoted_segments() {
        let uri: ResourceUri = r#"redb://db-1/appdb/table/"weird/name""#.parse().unwrap();
        assert_eq!(uri.container_name(), Some("weird/name"));
        // Generation re-quotes the slash-bearing segment.
        assert_eq!(uri.to_string(), r#"redb://db-1/appdb/table/"weird/name""#);

        let uri: ResourceUri = r#"template://"ns"/database/table/users"#.parse().unwrap();
        assert!(uri.is_template());
    }

    #[test]
    fn rejects_malformed_uris() {
        assert_eq!(
            "redb://db-1/appdb/table".parse::<ResourceUri>(),
            Err(UriError::SegmentCount {
                expected: "4 or 6",
                actual: 3
            }),
        );
        assert_eq!(
            "redb://db-1/appdb/table/orders/column".parse::<ResourceUri>(),
            Err(UriError::SegmentCount {
                expected: "4 or 6",
                actual: 5
            }),
        );
        assert_eq!(
            "stream://ws/kafka/integ".parse::<ResourceUri>(),
            Err(UriError::SegmentCount {
                expected: "4",
                actual: 3
            }),
        );
        assert!(matches!(
            "mailto://nope".parse::<ResourceUri>(),
            Err(UriError::UnknownScheme(_)),
        ));
        assert_eq!(
            "redb://db-1/appdb/cupboard/orders".parse::<ResourceUri>(),
            Err(UriError::UnknownContainerType("cupboard".to_string())),
        );
        assert_eq!(
            "template://ns/catalog/table/users".parse::<ResourceUri>(),
            Err(UriError::BadTemplateMarker("catalog".to_string())),
        );
        assert_eq!(
            r#"template://""/database/table/users"#.parse::<ResourceUri>(),
            Err(UriError::EmptyNamespace),
        );
        assert_eq!(
            "redb://db-1//table/orders".parse::<ResourceUri>(),
            Err(UriError::EmptySegment),
        );
        assert_eq!(
            r#"redb://db-1/appdb/table/"unclosed"#.parse::<ResourceUri>(),
            Err(UriError::UnterminatedQuote),
        );
    }

    #[test]
    fn uris_serialize_as_strings() {
        let uri = ResourceUri::Store(
            StoreUri::container("db-1", "appdb", ContainerType::Table, "orders")
                .with_item(ItemType::Column, "id"),
        );
        insta::assert_json_snapshot!(uri, @r###""redb://db-1/appdb/table/orders/column/id""###);

        let uri = ResourceUri::Template(TemplateUri::container(
            "crm",
            ContainerType::Collection,
            "accounts",
        ));
        insta::assert_json_snapshot!(uri, @r###""template://crm/database/collection/accounts""###);
    }

    #[test]
    fn stream_uri_round_trips() {
        let uri = ResourceUri::Stream(StreamUri {
            workspace_id: "ws-7".to_string(),
            platform: "kafka".to_string(),
            integration_name: "events".to_string(),
            topic_name: "orders-v1".to_string(),
        });
        assert_eq!(uri.to_string(), "stream://ws-7/kafka/events/orders-v1");
        assert_eq!(uri.to_string().parse::<ResourceUri>().unwrap(), uri);
    }
}
