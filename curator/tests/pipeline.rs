use anyhow::Result;
use curator::{
    config::Config,
    manifest::{DatasetManifest, MANIFEST_FILE},
    pipeline::{self, BUILD_REPORT_FILE},
    CurateError,
};
use image::{Rgb, RgbImage};
use lazy_static::lazy_static;
use serde_json::{json, Value};
use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};

lazy_static! {
    static ref TAXONOMY_FILE: PathBuf =
        Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/data/taxonomy.json");
}

/// Write a corpus with one image per record. Image ids start from 1 and
/// annotation ids are the image ids plus 1000.
fn write_corpus(dir: &Path, name: &str, labels: &[(&str, usize)]) -> Result<(PathBuf, PathBuf)> {
    let images_root = dir.join(name).join("images");
    fs::create_dir_all(&images_root)?;

    let categories: Vec<_> = labels
        .iter()
        .enumerate()
        .map(|(index, (label, _))| json!({ "id": index + 1, "name": label }))
        .collect();

    let mut images = vec![];
    let mut annotations = vec![];
    let mut image_id = 0;
    for (category_index, &(_, count)) in labels.iter().enumerate() {
        for _ in 0..count {
            image_id += 1;
            let file_name = format!("{}.png", image_id);
            let shade = (image_id * 11 % 256) as u8;
            RgbImage::from_fn(64, 48, |x, y| Rgb([shade, x as u8 * 4, y as u8 * 5]))
                .save(images_root.join(&file_name))?;

            images.push(json!({
                "id": image_id,
                "width": 64,
                "height": 48,
                "file_name": file_name,
            }));
            annotations.push(json!({
                "id": image_id + 1000,
                "image_id": image_id,
                "category_id": category_index + 1,
                "bbox": [8, 4, 32, 16],
                "iscrowd": 0,
            }));
        }
    }

    let annotations_file = dir.join(name).join("annotations.json");
    fs::write(
        &annotations_file,
        serde_json::to_vec(&json!({
            "categories": categories,
            "images": images,
            "annotations": annotations,
        }))?,
    )?;

    Ok((images_root, annotations_file))
}

fn source(name: &str, mapping: Value, images_root: &Path, annotations: &Path) -> Value {
    json!({
        "name": name,
        "max_images_per_class": 50,
        "mapping": mapping,
        "images_root": images_root,
        "partitions": [{ "name": name, "annotations": { "path": annotations } }],
    })
}

fn config(dir: &Path, sources: Vec<Value>, min_images_per_class: usize) -> Config {
    let config: Config = serde_json::from_value(json!({
        "taxonomy_file": &*TAXONOMY_FILE,
        "output_dir": dir.join("out"),
        "work_dir": dir.join("work"),
        "seed": 42,
        "workers": 4,
        "min_images_per_class": min_images_per_class,
        "split": { "train_ratio": 0.8, "val_ratio": 0.1 },
        "filter": { "min_box_size": 8.0, "min_box_area_ratio": 0.01 },
        "sources": sources,
    }))
    .unwrap();
    config.validate().unwrap();
    config
}

fn count_files(dir: &Path) -> usize {
    match fs::read_dir(dir) {
        Ok(entries) => entries.count(),
        Err(_) => 0,
    }
}

/// Two corpora sharing the paper cup class. The first drink can image of
/// the litter corpus is deleted.
fn two_sources(dir: &Path) -> Result<(Value, Value)> {
    let (taco_images, taco_annotations) = write_corpus(
        dir,
        "taco",
        &[("Drink can", 6), ("Paper cup", 4), ("Cigarette", 3)],
    )?;
    fs::remove_file(taco_images.join("1.png"))?;
    let (coco_images, coco_annotations) = write_corpus(
        dir,
        "coco",
        &[("cell phone", 5), ("cup", 2), ("person", 2)],
    )?;

    let taco = source(
        "taco",
        json!({ "type": "Heuristic" }),
        &taco_images,
        &taco_annotations,
    );
    let coco = source(
        "coco",
        json!({ "type": "Exact" }),
        &coco_images,
        &coco_annotations,
    );
    Ok((taco, coco))
}

#[tokio::test]
async fn single_surviving_class_is_fatal() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (images, annotations) =
        write_corpus(dir.path(), "taco", &[("Drink can", 5), ("Paper cup", 1)])?;
    let config = config(
        dir.path(),
        vec![source(
            "taco",
            json!({ "type": "Heuristic" }),
            &images,
            &annotations,
        )],
        2,
    );

    let err = pipeline::build(&config).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<CurateError>(),
        Some(CurateError::InsufficientClasses { kept: 1, .. })
    ));

    let out = dir.path().join("out");
    assert_eq!(count_files(&out.join("train/aluminum_can")), 3);
    assert_eq!(count_files(&out.join("val/aluminum_can")), 1);
    assert_eq!(count_files(&out.join("test/aluminum_can")), 1);
    assert!(!out.join("train/paper_cup").exists());
    assert!(!out.join(MANIFEST_FILE).exists());

    Ok(())
}

#[tokio::test]
async fn merge_two_sources() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (taco, coco) = two_sources(dir.path())?;
    let config = config(dir.path(), vec![taco, coco], 3);

    let report = pipeline::build(&config).await?;
    assert_eq!(report.class_count, 3);
    assert!(report.pruned.is_empty());

    let taco_report = &report.sources[0];
    assert_eq!(taco_report.plan.unmapped, 3);
    assert_eq!(taco_report.tasks_selected, 10);
    assert_eq!(taco_report.execute.saved, 9);
    assert_eq!(taco_report.execute.fetch_failed, 1);
    assert_eq!(report.sources[1].execute.saved, 7);

    let out = dir.path().join("out");
    let manifest = DatasetManifest::open(out.join(MANIFEST_FILE))?;
    assert_eq!(manifest.rows.len(), 16);
    assert_eq!(manifest.split_sizes.total(), 16);

    // paper cups come from both corpora, split separately per corpus
    assert_eq!(count_files(&out.join("train/paper_cup")), 3);
    assert_eq!(count_files(&out.join("val/paper_cup")), 2);
    assert_eq!(count_files(&out.join("test/paper_cup")), 1);

    let paths: HashSet<_> = manifest
        .rows
        .iter()
        .map(|row| row.relative_path.clone())
        .collect();
    assert_eq!(paths.len(), manifest.rows.len());
    assert!(paths.iter().any(|path| path.ends_with("/coco_6_1006.jpg")));
    assert!(paths.iter().any(|path| path.ends_with("/taco_7_1007.jpg")));

    let class_to_index: Value =
        serde_json::from_str(&fs::read_to_string(out.join("class_to_index.json"))?)?;
    assert_eq!(
        class_to_index,
        json!({ "aluminum_can": 0, "paper_cup": 1, "smartphone": 2 })
    );

    let labels: Value = serde_json::from_str(&fs::read_to_string(out.join("labels.json"))?)?;
    assert_eq!(
        labels["id2label"]["2"],
        json!({ "name": "Smartphone", "classKey": "smartphone", "category": "Electronics" })
    );

    assert!(dir.path().join("work").join(BUILD_REPORT_FILE).is_file());
    Ok(())
}

#[tokio::test]
async fn rebuild_is_reproducible() -> Result<()> {
    let corpus_dir = tempfile::tempdir()?;
    let (taco, coco) = two_sources(corpus_dir.path())?;

    let first_dir = tempfile::tempdir()?;
    let first = config(first_dir.path(), vec![taco.clone(), coco.clone()], 3);
    pipeline::build(&first).await?;

    // the same sources in the opposite order
    let second_dir = tempfile::tempdir()?;
    let second = config(second_dir.path(), vec![coco, taco], 3);
    pipeline::build(&second).await?;

    let first_manifest = DatasetManifest::open(first_dir.path().join("out").join(MANIFEST_FILE))?;
    let second_manifest =
        DatasetManifest::open(second_dir.path().join("out").join(MANIFEST_FILE))?;
    assert_eq!(first_manifest, second_manifest);

    Ok(())
}

#[tokio::test]
async fn reindex_keeps_manifest() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (taco, coco) = two_sources(dir.path())?;
    let config = config(dir.path(), vec![taco, coco], 3);
    pipeline::build(&config).await?;

    let built = DatasetManifest::open(dir.path().join("out").join(MANIFEST_FILE))?;
    let reindexed = pipeline::reindex(&config)?;
    assert_eq!(reindexed.manifest, built);
    assert!(reindexed.pruned.is_empty());

    Ok(())
}

#[tokio::test]
async fn plan_without_fetching() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (taco, coco) = two_sources(dir.path())?;
    let mut missing = coco.clone();
    missing["name"] = json!("missing");
    missing["partitions"][0]["annotations"]["path"] = json!(dir.path().join("nowhere.json"));
    let config = config(dir.path(), vec![taco, coco, missing], 3);

    let plans = pipeline::plan_sources(&config).await?;
    let counts: Vec<_> = plans
        .iter()
        .map(|source| (source.name.as_str(), source.plan.num_tasks()))
        .collect();
    assert_eq!(counts, [("taco", 10), ("coco", 7), ("missing", 0)]);
    assert!(plans[2].partitions.is_empty());
    assert!(!dir.path().join("work/taco/crops_tmp").exists());

    Ok(())
}

#[tokio::test]
async fn no_tasks_from_any_source() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (images, annotations) = write_corpus(dir.path(), "taco", &[("Cigarette", 4)])?;
    let config = config(
        dir.path(),
        vec![source(
            "taco",
            json!({ "type": "Heuristic" }),
            &images,
            &annotations,
        )],
        2,
    );

    let err = pipeline::build(&config).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<CurateError>(),
        Some(CurateError::NoCropTasks)
    ));
    Ok(())
}
