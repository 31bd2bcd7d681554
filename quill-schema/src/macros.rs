//! Macro that turns the table declarations into Arrow schemas with per-column
//! version metadata.

/// Field metadata key holding the schema version that introduced a column.
pub const SINCE_KEY: &str = "quill.since";

/// Map DSL token -> Arrow DataType.
#[macro_export]
macro_rules! __ty_to_arrow {
    ( Utf8 ) => { ::arrow::datatypes::DataType::Utf8 };
    ( UInt32 ) => { ::arrow::datatypes::DataType::UInt32 };
    ( UInt64 ) => { ::arrow::datatypes::DataType::UInt64 };
    ( Int64 )  => { ::arrow::datatypes::DataType::Int64 };
    ( Boolean ) => { ::arrow::datatypes::DataType::Boolean };
    ( Float64 ) => { ::arrow::datatypes::DataType::Float64 };
    ( FixedSizeListF32 ( $n:literal ) ) => {
        ::arrow::datatypes::DataType::FixedSizeList(
            ::std::sync::Arc::new(::arrow::datatypes::Field::new(
                "item",
                ::arrow::datatypes::DataType::Float32,
                true,
            )),
            $n as i32,
        )
    };
    ( TimestampMsUtc ) => {
        ::arrow::datatypes::DataType::Timestamp(
            ::arrow::datatypes::TimeUnit::Millisecond,
            Some("UTC".into()),
        )
    };
}

/// Declarative table definitions. Each column records the schema version that
/// introduced it; the table itself records when it first appeared.
#[macro_export]
macro_rules! define_tables {
    (
        $(
            table $Name:ident {
                name: $table:literal,
                since: $since:literal,
                fields: {
                    $( $fname:ident : $fty:ident $( ( $($args:tt)* ) )? @ $fsince:literal ),* $(,)?
                }
            }
        ),* $(,)?
    ) => {
        $(
            /// Declared shape of the `$table` table.
            pub struct $Name;

            impl $Name {
                pub const NAME: &'static str = $table;
                pub const SINCE: u32 = $since;

                /// Arrow schema with `quill.since` metadata on every field.
                pub fn schema() -> ::arrow::datatypes::Schema {
                    let mut fields: Vec<::arrow::datatypes::Field> = Vec::new();
                    $(
                        fields.push(
                            ::arrow::datatypes::Field::new(
                                stringify!($fname),
                                $crate::__ty_to_arrow!($fty $( ( $($args)* ) )?),
                                true,
                            )
                            .with_metadata(::std::collections::HashMap::from([(
                                $crate::macros::SINCE_KEY.to_string(),
                                $fsince.to_string(),
                            )])),
                        );
                    )*
                    ::arrow::datatypes::Schema::new(fields)
                }

                pub fn def() -> $crate::TableDef {
                    $crate::TableDef {
                        name: Self::NAME,
                        since: Self::SINCE,
                        schema: Self::schema(),
                    }
                }
            }
        )*

        /// Every declared table, in declaration order.
        pub fn table_defs() -> Vec<$crate::TableDef> {
            vec![ $( $Name::def() ),* ]
        }
    };
}
