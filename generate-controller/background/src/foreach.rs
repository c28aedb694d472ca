use crate::{generator::Generator, Error};
use generate_controller_core::{generate::ForEach, k8s::ResourceSpec, PolicyContext};
use serde_json::Value;

/// Runs each foreach block in order, generating one set of targets per list
/// element. The first failing element aborts the remainder of its block; the
/// context is restored before returning either way.
pub(crate) async fn apply(
    generator: &Generator<'_>,
    ctx: &mut PolicyContext,
    blocks: &[ForEach],
    generated: &mut Vec<ResourceSpec>,
) -> Result<(), Error> {
    for (index, block) in blocks.iter().enumerate() {
        let elements = generator
            .engine
            .resolve_list(ctx, &block.list)
            .map_err(|e| anyhow::anyhow!("foreach[{index}]: failed to evaluate list {:?}: {e}", block.list))?;
        tracing::debug!(index, elements = elements.len(), "Generating foreach block");

        ctx.json.checkpoint();
        let result = apply_block(generator, ctx, block, elements, generated).await;
        ctx.json.restore();
        result?;
    }
    Ok(())
}

async fn apply_block(
    generator: &Generator<'_>,
    ctx: &mut PolicyContext,
    block: &ForEach,
    elements: Vec<Value>,
    generated: &mut Vec<ResourceSpec>,
) -> Result<(), Error> {
    for (index, element) in elements.into_iter().enumerate() {
        ctx.json.reset();
        ctx.json.add("element", element);
        ctx.json.add("elementIndex", Value::from(index));

        generator
            .engine
            .load_context(ctx, &block.context)
            .await
            .map_err(|e| anyhow::anyhow!("failed to load context for element {index}: {e}"))?;

        generator
            .generate(ctx, &block.template, generated)
            .await
            .map_err(|error| {
                tracing::debug!(index, %error, "Foreach element failed");
                error
            })?;
    }
    Ok(())
}
