use crate::command::{Command, CommandContext, CommandDescriptor, CommandResult, Value};

/// Ordered list of child commands executed as a transaction.
///
/// On the first child failure the already-executed children are undone in
/// reverse order and the child's error is returned. `undo` runs every
/// child's `undo` in reverse order.
pub struct CompositeCommand {
    descriptor: CommandDescriptor,
    children: Vec<Box<dyn Command>>,
    executed_count: usize,
}

impl CompositeCommand {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            descriptor: CommandDescriptor::new(name),
            children: Vec::new(),
            executed_count: 0,
        }
    }

    pub fn with_command(mut self, command: Box<dyn Command>) -> Self {
        self.children.push(command);
        self
    }

    pub fn add_command(&mut self, command: Box<dyn Command>) {
        self.children.push(command);
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    fn rollback(&mut self, executed: usize, ctx: &CommandContext) {
        for index in (0..executed).rev() {
            let child = &mut self.children[index];
            if !child.can_undo(ctx) {
                log::warn!(
                    "child '{}' of '{}' cannot be undone during rollback",
                    child.descriptor().name,
                    self.descriptor.name
                );
                continue;
            }
            if let Err(e) = child.undo(ctx) {
                log::warn!(
                    "rollback of child '{}' in '{}' failed: {}",
                    child.descriptor().name,
                    self.descriptor.name,
                    e
                );
            }
        }
    }
}

impl Command for CompositeCommand {
    fn descriptor(&self) -> &CommandDescriptor {
        &self.descriptor
    }

    fn execute(&mut self, ctx: &CommandContext) -> CommandResult {
        self.executed_count = 0;
        for index in 0..self.children.len() {
            match self.children[index].execute(ctx) {
                Ok(_) => self.executed_count = index + 1,
                Err(e) => {
                    log::warn!(
                        "composite '{}' failed at child {} ('{}'), rolling back",
                        self.descriptor.name,
                        index,
                        self.children[index].descriptor().name
                    );
                    self.rollback(index, ctx);
                    self.executed_count = 0;
                    return Err(e);
                }
            }
        }
        Ok(Value::Int(self.executed_count as i64))
    }

    fn undo(&mut self, ctx: &CommandContext) -> CommandResult {
        for child in self.children.iter_mut().rev() {
            child.undo(ctx)?;
        }
        Ok(Value::Null)
    }

    fn can_execute(&self, ctx: &CommandContext) -> bool {
        self.children.iter().all(|child| child.can_execute(ctx))
    }

    fn can_undo(&self, ctx: &CommandContext) -> bool {
        !self.children.is_empty() && self.children.iter().all(|child| child.can_undo(ctx))
    }
}
