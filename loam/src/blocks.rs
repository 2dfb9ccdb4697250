//! Block trees: the recursively nested node structures embedded inside
//! `blocks`-typed columns. Parsed into an arena so reference write-back can
//! address slots by stable node index instead of live pointers.

use serde_json::Value;

pub type PropMap = serde_json::Map<String, Value>;

/// One node of a block tree.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockNode {
    pub node_type: String,
    pub props: PropMap,
    pub children: Vec<usize>,
}

/// Arena of block nodes. `roots` index into `nodes`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockTree {
    pub nodes: Vec<BlockNode>,
    pub roots: Vec<usize>,
}

/// Addresses one mutable slot a reference value lives in: either a
/// top-level record field or a property of a block node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Slot {
    Field(String),
    BlockProp { node: usize, key: String },
}

impl BlockTree {
    /// Parse the stored JSON shape (an array of nested
    /// `{type, props, children}` objects) into an arena. Returns `None`
    /// when the value is not an array of block objects.
    pub fn parse(value: &Value) -> Option<BlockTree> {
        let items = value.as_array()?;
        let mut tree = BlockTree::default();
        let mut roots = Vec::new();
        for item in items {
            roots.push(tree.add(item)?);
        }
        tree.roots = roots;
        Some(tree)
    }

    fn add(&mut self, value: &Value) -> Option<usize> {
        let obj = value.as_object()?;
        let node_type = obj.get("type")?.as_str()?.to_string();
        let props = obj
            .get("props")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let index = self.nodes.len();
        self.nodes.push(BlockNode {
            node_type,
            props,
            children: Vec::new(),
        });

        if let Some(children) = obj.get("children").and_then(Value::as_array) {
            let mut child_indices = Vec::with_capacity(children.len());
            for child in children {
                child_indices.push(self.add(child)?);
            }
            self.nodes[index].children = child_indices;
        }
        Some(index)
    }

    /// Render the arena back to the nested JSON shape.
    pub fn to_value(&self) -> Value {
        Value::Array(self.roots.iter().map(|&i| self.node_value(i)).collect())
    }

    fn node_value(&self, index: usize) -> Value {
        let node = &self.nodes[index];
        let mut obj = serde_json::Map::new();
        obj.insert("type".into(), Value::String(node.node_type.clone()));
        obj.insert("props".into(), Value::Object(node.props.clone()));
        obj.insert(
            "children".into(),
            Value::Array(node.children.iter().map(|&c| self.node_value(c)).collect()),
        );
        Value::Object(obj)
    }

    /// Iterate `(nodeIndex, propKey, propValue)` over every property of
    /// every node, in arena order.
    pub fn props(&self) -> impl Iterator<Item = (usize, &str, &Value)> {
        self.nodes.iter().enumerate().flat_map(|(i, node)| {
            node.props.iter().map(move |(k, v)| (i, k.as_str(), v))
        })
    }
}
