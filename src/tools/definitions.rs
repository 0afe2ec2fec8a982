//! Tool definitions advertised through `tools/list`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::ToolName;
use crate::engine::FeederCatalog;

/// Name, description and JSON Schema of one tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

impl ToolDefinition {
    pub fn new(name: ToolName, description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.to_string(),
            description: description.into(),
            input_schema,
        }
    }
}

fn voltage_limit(description: &str) -> Value {
    json!({"type": "number", "minimum": 0.5, "maximum": 1.5, "description": description})
}

/// Every tool, in the order they are usually called.
pub fn tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition::new(
            ToolName::LoadFeeder,
            "Load a built-in IEEE test feeder as the active circuit, optionally scaling loads, \
             changing the source voltage, or adding loads and DERs.",
            json!({
                "type": "object",
                "properties": {
                    "feeder_id": {
                        "type": "string",
                        "enum": FeederCatalog::ids(),
                        "description": "Feeder identifier (case-insensitive)"
                    },
                    "modifications": {
                        "type": "object",
                        "properties": {
                            "load_multiplier": {"type": "number", "exclusiveMinimum": 0, "maximum": 100},
                            "source_voltage_pu": {"type": "number", "minimum": 0.9, "maximum": 1.1},
                            "loads": {
                                "type": "array",
                                "items": {
                                    "type": "object",
                                    "properties": {
                                        "name": {"type": "string"},
                                        "bus": {"type": "string"},
                                        "kw": {"type": "number", "minimum": 0},
                                        "kvar": {"type": "number"},
                                        "phases": {"type": "array", "items": {"type": "integer", "minimum": 1, "maximum": 3}}
                                    },
                                    "required": ["bus", "kw"]
                                }
                            },
                            "ders": {
                                "type": "array",
                                "items": {
                                    "type": "object",
                                    "properties": {
                                        "name": {"type": "string"},
                                        "bus": {"type": "string"},
                                        "der_type": {"type": "string", "enum": ["solar", "battery", "wind"]},
                                        "kw": {"type": "number", "minimum": 0},
                                        "kvar": {"type": "number"}
                                    },
                                    "required": ["bus", "der_type", "kw"]
                                }
                            }
                        }
                    }
                },
                "required": ["feeder_id"]
            }),
        ),
        ToolDefinition::new(
            ToolName::RunPowerFlow,
            "Solve the power flow of the active circuit. Returns bus voltages, losses and, \
             when requested, harmonic distortion (THD) per bus and line.",
            json!({
                "type": "object",
                "properties": {
                    "feeder_id": {
                        "type": "string",
                        "description": "Must match the loaded feeder when given"
                    },
                    "options": {
                        "type": "object",
                        "properties": {
                            "max_iterations": {"type": "integer", "minimum": 1, "maximum": 1000},
                            "tolerance": {"type": "number", "exclusiveMinimum": 0, "maximum": 1},
                            "control_mode": {
                                "type": "string",
                                "description": "Solution mode name; unsupported modes fall back to snapshot"
                            },
                            "harmonic_analysis": {"type": "boolean", "default": false},
                            "harmonic_orders": {
                                "type": "array",
                                "items": {"type": "integer", "minimum": 1, "maximum": 50}
                            }
                        }
                    }
                }
            }),
        ),
        ToolDefinition::new(
            ToolName::CheckVoltages,
            "Check the solved bus voltages against a per-unit band and classify each \
             violation by severity.",
            json!({
                "type": "object",
                "properties": {
                    "min_voltage_pu": voltage_limit("Lower limit (default 0.95)"),
                    "max_voltage_pu": voltage_limit("Upper limit (default 1.05)"),
                    "phase": {"type": "integer", "minimum": 1, "maximum": 3, "description": "Only check this phase"}
                }
            }),
        ),
        ToolDefinition::new(
            ToolName::AnalyzeCapacity,
            "Find the largest DER that can be connected at a bus by stepping its size \
             until a voltage, thermal or convergence limit is breached.",
            json!({
                "type": "object",
                "properties": {
                    "bus_id": {"type": "string"},
                    "der_type": {"type": "string", "enum": ["solar", "battery", "wind"]},
                    "increment_kw": {"type": "number", "exclusiveMinimum": 0, "default": 100},
                    "max_capacity_kw": {"type": "number", "exclusiveMinimum": 0, "default": 10000},
                    "constraints": {
                        "type": "object",
                        "properties": {
                            "min_voltage_pu": voltage_limit("Lower limit (default 0.95)"),
                            "max_voltage_pu": voltage_limit("Upper limit (default 1.05)"),
                            "max_line_loading_pct": {"type": "number", "exclusiveMinimum": 0, "default": 100}
                        }
                    }
                },
                "required": ["bus_id", "der_type"]
            }),
        ),
        ToolDefinition::new(
            ToolName::OptimizeDerPlacement,
            "Try a DER of fixed size at each candidate bus and rank the buses by the \
             chosen objective.",
            json!({
                "type": "object",
                "properties": {
                    "der_type": {
                        "type": "string",
                        "enum": ["solar", "battery", "wind", "solar_vvc", "solar_battery", "solar_battery_vvc"]
                    },
                    "capacity_kw": {"type": "number", "exclusiveMinimum": 0},
                    "objective": {
                        "type": "string",
                        "enum": ["minimize_losses", "minimize_violations", "maximize_capacity"],
                        "default": "minimize_losses"
                    },
                    "candidate_buses": {"type": "array", "items": {"type": "string"}},
                    "battery_kwh": {"type": "number", "minimum": 0},
                    "control_settings": {
                        "type": "object",
                        "properties": {
                            "curve": {"type": "string", "enum": ["IEEE1547", "RULE21"]},
                            "response_time": {"type": "number", "minimum": 0, "maximum": 600}
                        }
                    }
                },
                "required": ["der_type", "capacity_kw"]
            }),
        ),
        ToolDefinition::new(
            ToolName::RunTimeSeries,
            "Solve the circuit once per time step while scaling all loads by an hourly \
             profile, and summarize losses and voltage extremes.",
            json!({
                "type": "object",
                "properties": {
                    "load_profile": {
                        "type": "object",
                        "properties": {
                            "name": {"type": "string"},
                            "multipliers": {
                                "type": "array",
                                "items": {"type": "number", "minimum": 0},
                                "minItems": 1,
                                "maxItems": 8760
                            }
                        },
                        "required": ["multipliers"]
                    },
                    "duration_hours": {"type": "number", "exclusiveMinimum": 0, "maximum": 8760, "default": 24},
                    "timestep_minutes": {"type": "number", "minimum": 1, "maximum": 1440, "default": 60}
                },
                "required": ["load_profile"]
            }),
        ),
        ToolDefinition::new(
            ToolName::GenerateVisualization,
            "Render the circuit or a stored analysis result as an SVG plot, returned \
             inline or written to save_path.",
            json!({
                "type": "object",
                "properties": {
                    "plot_type": {
                        "type": "string",
                        "enum": ["voltage_profile", "network_diagram", "timeseries", "capacity_curve", "harmonics_spectrum"]
                    },
                    "data_source": {
                        "type": "string",
                        "enum": [
                            "circuit", "last_power_flow", "last_capacity",
                            "last_timeseries", "last_harmonics", "last_voltage_check"
                        ]
                    },
                    "options": {
                        "type": "object",
                        "properties": {
                            "title": {"type": "string"},
                            "figsize": {"type": "array", "items": {"type": "number"}, "minItems": 2, "maxItems": 2},
                            "dpi": {"type": "integer", "minimum": 10, "maximum": 600},
                            "save_path": {"type": "string"},
                            "show_violations": {"type": "boolean", "default": true},
                            "show_grid": {"type": "boolean", "default": true},
                            "variables": {
                                "type": "array",
                                "items": {
                                    "type": "string",
                                    "enum": ["total_load_kw", "losses_kw", "min_voltage_pu", "max_voltage_pu", "load_multiplier"]
                                }
                            },
                            "xlabel": {"type": "string"},
                            "ylabel": {"type": "string"},
                            "layout": {"type": "string", "enum": ["tree", "radial", "spring"]},
                            "min_voltage_pu": voltage_limit("Lower reference line"),
                            "max_voltage_pu": voltage_limit("Upper reference line")
                        }
                    }
                },
                "required": ["plot_type"]
            }),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_every_tool_is_defined_once() {
        let defs = tool_definitions();
        assert_eq!(defs.len(), ToolName::iter().count());
        for tool in ToolName::iter() {
            assert_eq!(defs.iter().filter(|d| d.name == tool.to_string()).count(), 1, "{tool}");
        }
    }

    #[test]
    fn test_schemas_are_objects() {
        for def in tool_definitions() {
            assert_eq!(def.input_schema["type"], "object", "{}", def.name);
            assert!(def.input_schema["properties"].is_object(), "{}", def.name);
            assert!(!def.description.is_empty());
        }
    }

    #[test]
    fn test_serialized_field_name() {
        let value = serde_json::to_value(&tool_definitions()[0]).unwrap();
        assert!(value.get("inputSchema").is_some());
        assert_eq!(value["name"], "load_feeder");
        assert_eq!(value["inputSchema"]["required"], json!(["feeder_id"]));
    }
}
