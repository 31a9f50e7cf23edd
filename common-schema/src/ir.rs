//! The schema intermediate representation (spec.md §4.5): a pool of
//! interned nodes produced by walking a JSON-Schema document.

use serde_json::Value;

/// An index into a [`crate::SchemaIr`] pool.
pub type IrId = u32;

/// The runtime type a [`IrNode::TypeCheck`] matches against.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JsonType {
    Null,
    Boolean,
    Number,
    String,
    Array,
    Object,
}

impl JsonType {
    pub(crate) fn matches(self, value: &Value) -> bool {
        match self {
            JsonType::Null => value.is_null(),
            JsonType::Boolean => value.is_boolean(),
            JsonType::Number => value.is_number(),
            JsonType::String => value.is_string(),
            JsonType::Array => value.is_array(),
            JsonType::Object => value.is_object(),
        }
    }

    pub(crate) fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "null" => JsonType::Null,
            "boolean" => JsonType::Boolean,
            "number" | "integer" => JsonType::Number,
            "string" => JsonType::String,
            "array" => JsonType::Array,
            "object" => JsonType::Object,
            _ => return None,
        })
    }
}

/// How unlisted object keys are treated by [`IrNode::Props`].
#[derive(Clone, Debug)]
pub enum Additional {
    /// `additionalProperties` absent: unlisted keys are unconstrained.
    Omit,
    /// `additionalProperties: true`.
    Allow,
    /// `additionalProperties: false`: unlisted keys are forbidden.
    Deny,
    /// `additionalProperties: <schema>`.
    Schema(IrId),
}

/// One compiled schema node.
#[derive(Clone, Debug)]
pub enum IrNode {
    TypeCheck(JsonType),
    Const(Value),
    Enum(Vec<Value>),
    Range {
        minimum: Option<f64>,
        maximum: Option<f64>,
        exclusive_minimum: bool,
        exclusive_maximum: bool,
    },
    /// Holds the compiled node's own index into [`crate::SchemaIr::patterns`]
    /// rather than the `Regex` itself, since `Regex` has no useful `Eq`.
    Pattern(usize),
    Props {
        required: Vec<String>,
        properties: Vec<(String, IrId)>,
        additional: Additional,
        /// Labels carried by `ifc.classification` on this schema node
        /// (spec.md §C supplemented feature), unioned into
        /// `EvalOutcome::labels` for every touch of this node.
        labels: Vec<String>,
    },
    ItemsTuple {
        items: Vec<IrId>,
    },
    ItemsEach {
        item: IrId,
    },
    AllOf(Vec<IrId>),
    AnyOf(Vec<IrId>),
    /// An alias produced by two-phase `$ref` resolution: a provisional id
    /// allocated before recursing into a (possibly cyclic) target, aliased
    /// to the target's final id once compiled (spec.md §9 "cyclic pattern
    /// graphs → two-phase identity").
    Ref(IrId),
    /// Always-Yes (`{}` or `true`).
    Any,
    /// Always-No (`false`).
    Never,
    /// Wraps `inner` with the non-validating annotations this runtime acts
    /// on: `default` (cell read-time expansion, spec.md §4.7), `asCell`
    /// (read the location as a cell reference rather than resolving it) and
    /// `asStream` (the location is a stream address, spec.md §4.9). The
    /// verdict of an `Annotated` node is always `inner`'s verdict; these
    /// keywords carry no validation weight of their own.
    Annotated {
        inner: IrId,
        default: Option<Value>,
        as_cell: bool,
        as_stream: bool,
    },
}
