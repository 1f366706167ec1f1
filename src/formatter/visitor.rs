use crate::ast::{ActionDef, Definition, Precondition, RuleDef, Statement};
use crate::formatter::config::FormatterConfig;

/// Renders definitions as canonical, re-parseable DSL text.
pub struct FormatterVisitor {
    config: FormatterConfig,
    indent_level: usize,
    output: String,
}

impl FormatterVisitor {
    pub fn new(config: FormatterConfig) -> Self {
        Self {
            config,
            indent_level: 0,
            output: String::new(),
        }
    }

    pub fn format_definitions(mut self, definitions: &[Definition]) -> String {
        for (i, definition) in definitions.iter().enumerate() {
            if i > 0 && self.config.block_spacing {
                self.newline();
            }
            self.format_definition(definition);
        }
        self.output
    }

    fn format_definition(&mut self, definition: &Definition) {
        match definition {
            Definition::Action(action) => self.format_action(action),
            Definition::Rule(rule) => self.format_rule(rule),
        }
    }

    fn format_action(&mut self, action: &ActionDef) {
        self.write(&format!("ACTION {}", action.qualified_name()));
        if !action.parameters.is_empty() {
            let params: Vec<String> = action
                .parameters
                .iter()
                .map(|p| format!("{}: {}{}", p.name, p.param_type, if p.optional { "?" } else { "" }))
                .collect();
            self.write(&format!("({})", params.join(", ")));
        }
        self.open_block();

        for precondition in &action.preconditions {
            self.format_precondition(precondition);
        }
        if let Some(effect) = &action.effect {
            self.write("EFFECT");
            self.open_block();
            self.format_statements(effect);
            self.close_block();
        }

        self.close_block();
    }

    fn format_precondition(&mut self, precondition: &Precondition) {
        let name = precondition
            .name
            .as_ref()
            .map(|n| format!(" {}", n))
            .unwrap_or_default();
        self.write(&format!(
            "PRECONDITION{}: {} ON_FAILURE: \"{}\"",
            name, precondition.condition, precondition.on_failure
        ));
        self.newline();
    }

    fn format_rule(&mut self, rule: &RuleDef) {
        self.write(&format!("RULE {}", rule.name));
        if rule.priority != 0 {
            self.write(&format!(" PRIORITY {}", rule.priority));
        }
        self.open_block();

        self.write(&format!("ON {}", rule.trigger));
        self.newline();

        let body = &rule.body;
        self.write(&format!("FOR ({}: {}", body.variable, body.entity_type));
        if let Some(condition) = &body.condition {
            self.write(&format!(" WHERE {}", condition));
        }
        self.write(")");
        self.open_block();
        self.format_statements(&body.statements);
        self.close_block();

        self.close_block();
    }

    fn format_statements(&mut self, statements: &[Statement]) {
        for statement in statements {
            self.write(&statement.to_string());
            self.newline();
        }
    }

    fn open_block(&mut self) {
        self.output.push_str(" {");
        self.indent_level += 1;
        self.newline();
    }

    fn close_block(&mut self) {
        self.indent_level = self.indent_level.saturating_sub(1);
        self.write("}");
        self.newline();
    }

    fn write(&mut self, text: &str) {
        if self.output.ends_with('\n') || self.output.is_empty() {
            self.output
                .push_str(&" ".repeat(self.indent_level * self.config.indent_spaces));
        }
        self.output.push_str(text);
    }

    fn newline(&mut self) {
        self.output.push('\n');
    }
}
