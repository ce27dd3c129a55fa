/// NFT registration specifics.
///
/// NFT tickets carry the creative metadata bundle and pay their fee
/// inside the ticket, capped by `maximum_fee`. The thumbnail is a square
/// crop centered on the image.
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{GatewayError, Result};
use crate::state::models::Task;

use super::PipelineCtx;

/// Creative metadata supplied at submit time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NftProperties {
    pub name: String,
    pub description: String,
    pub creator_name: String,
    pub creator_website_url: String,
    pub keywords: String,
    pub series_name: String,
    pub youtube_url: String,
    pub issued_copies: i64,
    pub royalty: f64,
    pub green: bool,
    /// Fee ceiling in whole coins; 0 means "use the network default".
    pub maximum_fee: i64,
}

/// Square crop coordinates inside the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThumbnailCoordinate {
    pub top_left_x: u32,
    pub top_left_y: u32,
    pub bottom_right_x: u32,
    pub bottom_right_y: u32,
}

/// Center a square of the given edge inside an image, clamping at the
/// borders for images smaller than the square.
pub fn centered_square(width: u32, height: u32, size: u32) -> ThumbnailCoordinate {
    let center_x = width / 2;
    let center_y = height / 2;
    let half = size / 2;

    ThumbnailCoordinate {
        top_left_x: center_x.saturating_sub(half),
        top_left_y: center_y.saturating_sub(half),
        bottom_right_x: (center_x + half).min(width),
        bottom_right_y: (center_y + half).min(height),
    }
}

/// Thumbnail coordinates for raw image bytes.
pub fn thumbnail_coordinates(image_bytes: &[u8], size: u32) -> Result<ThumbnailCoordinate> {
    let img = image::load_from_memory(image_bytes)
        .map_err(|e| GatewayError::Policy(format!("cannot decode image: {e}")))?;
    Ok(centered_square(img.width(), img.height(), size))
}

/// Build the WalletNode NFT register request.
///
/// Enforces the fee ceiling: a quoted fee above `maximum_fee` (explicit
/// or derived from the network rate) is a policy failure.
pub async fn register_form(ctx: &PipelineCtx, task: &Task, spendable_address: &str) -> Result<Value> {
    let raw = task
        .nft_properties
        .clone()
        .ok_or_else(|| GatewayError::Invariant(format!("task {} has no nft properties", task.id)))?;
    let props: NftProperties = serde_json::from_value(raw)
        .map_err(|e| GatewayError::Serialization(format!("bad nft properties: {e}")))?;

    let maximum_fee = if props.maximum_fee > 0 {
        props.maximum_fee
    } else {
        let network_fee = ctx.rpc.get_network_storage_fee().await?;
        network_fee * ctx.config.nft_default_max_file_size_for_fee_mb as i64
    };

    if task.wn_fee > maximum_fee {
        return Err(GatewayError::Policy(format!(
            "quoted fee {} exceeds maximum fee {maximum_fee}",
            task.wn_fee
        )));
    }

    let thumbnail = match task.original_file_local_path.as_deref() {
        Some(path) => {
            let bytes = ctx.cache.read_original(std::path::Path::new(path)).await?;
            thumbnail_coordinates(&bytes, ctx.config.nft_thumbnail_size_px)?
        }
        None => centered_square(
            ctx.config.nft_thumbnail_size_px,
            ctx.config.nft_thumbnail_size_px,
            ctx.config.nft_thumbnail_size_px,
        ),
    };

    Ok(json!({
        "spendable_address": spendable_address,
        "creator_pastelid": task.pastel_id,
        "image_id": task.wn_file_id,
        "make_publicly_accessible": task.make_publicly_accessible,
        "collection_act_txid": task.collection_act_txid,
        "open_api_group_id": task.open_api_group_id,
        "creator_name": props.creator_name,
        "creator_website_url": props.creator_website_url,
        "description": props.description,
        "green": props.green,
        "issued_copies": props.issued_copies,
        "keywords": props.keywords,
        "maximum_fee": maximum_fee,
        "name": props.name,
        "royalty": props.royalty,
        "series_name": props.series_name,
        "thumbnail_coordinate": thumbnail,
        "youtube_url": props.youtube_url,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_centered_square_in_large_image() {
        let c = centered_square(1000, 800, 256);
        assert_eq!(c.top_left_x, 372);
        assert_eq!(c.top_left_y, 272);
        assert_eq!(c.bottom_right_x, 628);
        assert_eq!(c.bottom_right_y, 528);
        assert_eq!(c.bottom_right_x - c.top_left_x, 256);
        assert_eq!(c.bottom_right_y - c.top_left_y, 256);
    }

    #[test]
    fn test_centered_square_clamps_small_image() {
        let c = centered_square(100, 60, 256);
        assert_eq!(c.top_left_x, 0);
        assert_eq!(c.top_left_y, 0);
        assert_eq!(c.bottom_right_x, 100);
        assert_eq!(c.bottom_right_y, 60);
    }

    #[test]
    fn test_centered_square_exact_fit() {
        let c = centered_square(256, 256, 256);
        assert_eq!(c.top_left_x, 0);
        assert_eq!(c.bottom_right_x, 256);
    }

    #[test]
    fn test_thumbnail_from_real_png() {
        let img = image::DynamicImage::new_rgb8(512, 512);
        let mut bytes = Vec::new();
        img.write_to(
            &mut std::io::Cursor::new(&mut bytes),
            image::ImageFormat::Png,
        )
        .unwrap();

        let c = thumbnail_coordinates(&bytes, 256).unwrap();
        assert_eq!(c.top_left_x, 128);
        assert_eq!(c.bottom_right_x, 384);
    }

    #[test]
    fn test_thumbnail_rejects_garbage() {
        let err = thumbnail_coordinates(b"not an image", 256).unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_properties_default_fee_is_unset() {
        let props: NftProperties = serde_json::from_value(json!({"name": "My NFT"})).unwrap();
        assert_eq!(props.maximum_fee, 0);
        assert_eq!(props.name, "My NFT");
    }
}
