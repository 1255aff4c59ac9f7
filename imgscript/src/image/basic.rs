//! Reference image library.
//!
//! A deliberately small [`ImageLibrary`]: literal/blank image creation,
//! pointwise arithmetic, a few pointwise math functions, clamping and
//! normalization, plus the math evaluator from [`super::expr`].
//!
//! | Operation | Arguments |
//! |-----------|-----------|
//! | `input` | `(v,v;v…)` literal, or `w[,h[,d[,s[,value]]]]` |
//! | `add sub mul div pow min max` | number, `[img]`, or none (fold selection) |
//! | `fill` | number or per-pixel expression (`x y z c i w h d s`) |
//! | `abs sqrt exp log sin cos round` | none |
//! | `cut` | `min,max` |
//! | `normalize` | `min,max` |

use crate::error::{EvalError, OpError};
use crate::script::value::{floored_rem, parse_number, Value};

use super::expr::{self, EvalContext};
use super::{ExprContext, Image, ImageLibrary, ImageSlot, OpArg};

/// The built-in reference implementation of [`ImageLibrary`].
#[derive(Debug, Default, Clone, Copy)]
pub struct BasicLibrary;

impl BasicLibrary {
    pub fn new() -> Self {
        BasicLibrary
    }
}

// ── Expression variables ──────────────────────────────────────────────────────

/// Image features visible to expressions, plus the pixel being filled.
struct ImageVars<'a> {
    image: Option<&'a Image>,
    image_count: usize,
    pixel: Option<(usize, usize, usize, usize, f64)>,
}

impl EvalContext for ImageVars<'_> {
    fn variable(&self, name: &str) -> Option<Value> {
        if let Some((x, y, z, c, i)) = self.pixel {
            match name {
                "x" => return Some(Value::Scalar(x as f64)),
                "y" => return Some(Value::Scalar(y as f64)),
                "z" => return Some(Value::Scalar(z as f64)),
                "c" => return Some(Value::Scalar(c as f64)),
                "i" => return Some(Value::Scalar(i)),
                _ => {}
            }
        }
        if name == "l" {
            return Some(Value::Scalar(self.image_count as f64));
        }
        let img = self.image?;
        let (w, h, d, s) = (img.width(), img.height(), img.depth(), img.spectrum());
        let v = match name {
            "w" => w,
            "h" => h,
            "d" => d,
            "s" => s,
            "wh" => w * h,
            "whd" => w * h * d,
            "whds" => w * h * d * s,
            _ => return None,
        };
        Some(Value::Scalar(v as f64))
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn pointwise(
    images: &mut [ImageSlot],
    selection: &[usize],
    f: impl Fn(f32) -> f32,
) -> Result<(), OpError> {
    for &i in selection {
        let img = slot_mut(images, i)?;
        for v in img.data_mut() {
            *v = f(*v);
        }
    }
    Ok(())
}

fn slot_mut(images: &mut [ImageSlot], i: usize) -> Result<&mut Image, OpError> {
    images
        .get_mut(i)
        .ok_or_else(|| OpError::InvalidArgument(format!("[{i}]")))?
        .get_mut(i)
}

fn slot(images: &[ImageSlot], i: usize) -> Result<&Image, OpError> {
    images
        .get(i)
        .ok_or_else(|| OpError::InvalidArgument(format!("[{i}]")))?
        .get(i)
}

fn arithmetic(name: &str) -> Option<fn(f32, f32) -> f32> {
    let f: fn(f32, f32) -> f32 = match name {
        "add" => |a, b| a + b,
        "sub" => |a, b| a - b,
        "mul" => |a, b| a * b,
        "div" => |a, b| a / b,
        "pow" => f32::powf,
        "min" => f32::min,
        "max" => f32::max,
        _ => return None,
    };
    Some(f)
}

fn unary(name: &str) -> Option<fn(f32) -> f32> {
    let f: fn(f32) -> f32 = match name {
        "abs" => f32::abs,
        "sqrt" => f32::sqrt,
        "exp" => f32::exp,
        "log" => f32::ln,
        "sin" => f32::sin,
        "cos" => f32::cos,
        "round" => f32::round,
        _ => return None,
    };
    Some(f)
}

fn two_numbers(args: &[OpArg]) -> Result<(f32, f32), OpError> {
    match args {
        [OpArg::Number(a), OpArg::Number(b)] => Ok((*a as f32, *b as f32)),
        _ => Err(OpError::InvalidArgument(describe(args))),
    }
}

fn describe(args: &[OpArg]) -> String {
    args.iter()
        .map(|a| match a {
            OpArg::Number(x) => crate::script::value::format_number(*x),
            OpArg::Image(i) => format!("[{i}]"),
            OpArg::Text(t) => t.clone(),
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Apply `f(pixel, operand)` where the operand image is cycled over.
fn with_image(
    images: &mut [ImageSlot],
    selection: &[usize],
    operand: usize,
    f: fn(f32, f32) -> f32,
) -> Result<(), OpError> {
    let other = slot(images, operand)?.clone();
    if other.is_empty() {
        return Err(OpError::InvalidArgument(format!("[{operand}]")));
    }
    let src = other.data();
    for &i in selection {
        let img = slot_mut(images, i)?;
        for (k, v) in img.data_mut().iter_mut().enumerate() {
            *v = f(*v, src[k % src.len()]);
        }
    }
    Ok(())
}

/// Fold the selected images into the first one and drop the others.
fn fold_selection(
    images: &mut Vec<ImageSlot>,
    names: &mut Vec<String>,
    selection: &[usize],
    f: fn(f32, f32) -> f32,
) -> Result<(), OpError> {
    let mut sel: Vec<usize> = selection.to_vec();
    sel.sort_unstable();
    sel.dedup();
    let Some((&first, rest)) = sel.split_first() else {
        return Ok(());
    };
    for &j in rest {
        with_image(images, &[first], j, f)?;
    }
    for &j in rest.iter().rev() {
        images.remove(j);
        names.remove(j);
    }
    Ok(())
}

/// Largest image `input` will allocate, in values.
const MAX_VALUES: usize = 1 << 28;

fn checked_size(dims: [usize; 4], text: &str) -> Result<(), OpError> {
    dims.iter()
        .try_fold(1usize, |acc, &n| acc.checked_mul(n))
        .filter(|&n| n <= MAX_VALUES)
        .map(|_| ())
        .ok_or_else(|| OpError::InvalidArgument(text.to_owned()))
}

/// `(1,2,3;4,5,6)`: `,` next column, `;` next row, `/` next slice,
/// `^` next channel.  Missing values are zero.
fn parse_literal(text: &str) -> Result<Image, OpError> {
    let inner = &text[1..text.len() - 1];
    let bad = || OpError::InvalidArgument(text.to_owned());
    // channel → slice → row → values
    let mut channels: Vec<Vec<Vec<Vec<f32>>>> = Vec::new();
    let (mut w, mut h, mut d) = (0usize, 0usize, 0usize);
    for chan in inner.split('^') {
        let mut slices = Vec::new();
        for slice in chan.split('/') {
            let mut rows = Vec::new();
            for row in slice.split(';') {
                let line = row
                    .split(',')
                    .map(|col| parse_number(col).map(|v| v as f32).ok_or_else(bad))
                    .collect::<Result<Vec<f32>, _>>()?;
                w = w.max(line.len());
                rows.push(line);
            }
            h = h.max(rows.len());
            slices.push(rows);
        }
        d = d.max(slices.len());
        channels.push(slices);
    }
    let s = channels.len();
    checked_size([w, h, d, s], text)?;
    let mut img = Image::new(w, h, d, s);
    for (c, slices) in channels.into_iter().enumerate() {
        for (z, rows) in slices.into_iter().enumerate() {
            for (y, line) in rows.into_iter().enumerate() {
                for (x, v) in line.into_iter().enumerate() {
                    let off = img.offset(x, y, z, c);
                    img.data_mut()[off] = v;
                }
            }
        }
    }
    Ok(img)
}

fn parse_dimensions(text: &str) -> Result<Image, OpError> {
    let bad = || OpError::InvalidArgument(text.to_owned());
    let nums = text
        .split(',')
        .map(|t| parse_number(t).ok_or_else(bad))
        .collect::<Result<Vec<f64>, _>>()?;
    if nums.is_empty() || nums.len() > 5 {
        return Err(bad());
    }
    let dim = |k: usize| -> Result<usize, OpError> {
        let v = nums.get(k).copied().unwrap_or(1.0);
        if !(0.0..=MAX_VALUES as f64).contains(&v) || v.fract() != 0.0 {
            return Err(bad());
        }
        Ok(v as usize)
    };
    let dims = [dim(0)?, dim(1)?, dim(2)?, dim(3)?];
    checked_size(dims, text)?;
    let value = nums.get(4).copied().unwrap_or(0.0) as f32;
    Ok(Image::filled(dims[0], dims[1], dims[2], dims[3], value))
}

fn input(
    images: &mut Vec<ImageSlot>,
    names: &mut Vec<String>,
    selection: &[usize],
    args: &[OpArg],
) -> Result<(), OpError> {
    let text = match args {
        [OpArg::Text(t)] => t.trim(),
        _ => return Err(OpError::InvalidArgument(describe(args))),
    };
    let img = if text.len() >= 2 && text.starts_with('(') && text.ends_with(')') {
        parse_literal(text)?
    } else if text.starts_with(|c: char| c.is_ascii_digit()) {
        parse_dimensions(text)?
    } else {
        return Err(OpError::Unsupported(format!("input '{text}' (file I/O)")));
    };
    let at = selection.first().copied().unwrap_or(images.len()).min(images.len());
    images.insert(at, ImageSlot::Owned(img));
    names.insert(at, text.to_owned());
    Ok(())
}

fn fill(
    images: &mut [ImageSlot],
    selection: &[usize],
    args: &[OpArg],
) -> Result<(), OpError> {
    let image_count = images.len();
    match args {
        [OpArg::Number(v)] => pointwise(images, selection, |_| *v as f32),
        [OpArg::Text(src)] => {
            let ast = expr::parse_expr(src).map_err(OpError::Failed)?;
            for &i in selection {
                let img = slot_mut(images, i)?;
                let snapshot = img.clone();
                for (off, v) in img.data_mut().iter_mut().enumerate() {
                    let (x, y, z, c) = snapshot.coords(off);
                    let vars = ImageVars {
                        image: Some(&snapshot),
                        image_count,
                        pixel: Some((x, y, z, c, *v as f64)),
                    };
                    *v = expr::eval_expr(&ast, &vars)
                        .map_err(OpError::Failed)?
                        .as_scalar() as f32;
                }
            }
            Ok(())
        }
        _ => Err(OpError::InvalidArgument(describe(args))),
    }
}

fn normalize(images: &mut [ImageSlot], selection: &[usize], lo: f32, hi: f32) -> Result<(), OpError> {
    for &i in selection {
        let img = slot_mut(images, i)?;
        let (min, max) = img
            .data()
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(a, b), &v| (a.min(v), b.max(v)));
        let range = max - min;
        for v in img.data_mut() {
            *v = if range > 0.0 { lo + (*v - min) * (hi - lo) / range } else { lo };
        }
    }
    Ok(())
}

// ── ImageLibrary ──────────────────────────────────────────────────────────────

impl ImageLibrary for BasicLibrary {
    fn apply_operation(
        &self,
        name: &str,
        selection: &[usize],
        args: &[OpArg],
        images: &mut Vec<ImageSlot>,
        names: &mut Vec<String>,
    ) -> Result<(), OpError> {
        if let Some(f) = arithmetic(name) {
            return match args {
                [] => fold_selection(images, names, selection, f),
                [OpArg::Number(v)] => {
                    let v = *v as f32;
                    pointwise(images, selection, |x| f(x, v))
                }
                [OpArg::Image(j)] => with_image(images, selection, *j, f),
                _ => Err(OpError::InvalidArgument(describe(args))),
            };
        }
        if let Some(f) = unary(name) {
            if !args.is_empty() {
                return Err(OpError::InvalidArgument(describe(args)));
            }
            return pointwise(images, selection, f);
        }
        match name {
            "input" => input(images, names, selection, args),
            "fill" => fill(images, selection, args),
            "cut" => {
                let (lo, hi) = two_numbers(args)?;
                pointwise(images, selection, |v| v.clamp(lo.min(hi), hi.max(lo)))
            }
            "normalize" => {
                let (lo, hi) = two_numbers(args)?;
                normalize(images, selection, lo, hi)
            }
            "mod" => match args {
                [OpArg::Number(v)] => {
                    let v = *v;
                    pointwise(images, selection, |x| floored_rem(x as f64, v) as f32)
                }
                _ => Err(OpError::InvalidArgument(describe(args))),
            },
            other => Err(OpError::Unsupported(other.to_owned())),
        }
    }

    fn evaluate_expression(&self, src: &str, ctx: &ExprContext<'_>) -> Result<Value, EvalError> {
        let vars = ImageVars { image: ctx.image, image_count: ctx.image_count, pixel: None };
        expr::evaluate(src, &vars).map_err(EvalError)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageList;

    fn run(list: &mut ImageList, name: &str, sel: &[usize], args: &[OpArg]) -> Result<(), OpError> {
        BasicLibrary.apply_operation(name, sel, args, &mut list.slots, &mut list.names)
    }

    fn first_values(list: &ImageList) -> Vec<f32> {
        (0..list.len()).map(|i| list.image(i).unwrap().data()[0]).collect()
    }

    #[test]
    fn input_literal() {
        let mut l = ImageList::new();
        run(&mut l, "input", &[], &[OpArg::Text("(1,2,3;4,5,6)".into())]).unwrap();
        let img = l.image(0).unwrap();
        assert_eq!((img.width(), img.height(), img.depth(), img.spectrum()), (3, 2, 1, 1));
        assert_eq!(img.data(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(l.name(0), Some("(1,2,3;4,5,6)"));
    }

    #[test]
    fn input_dimensions_with_value() {
        let mut l = ImageList::new();
        run(&mut l, "input", &[], &[OpArg::Text("4,3,1,2,7".into())]).unwrap();
        let img = l.image(0).unwrap();
        assert_eq!(img.len(), 24);
        assert!(img.data().iter().all(|&v| v == 7.0));
    }

    #[test]
    fn input_literal_uneven_slices() {
        let mut l = ImageList::new();
        run(&mut l, "input", &[], &[OpArg::Text("(1;2/3)".into())]).unwrap();
        let img = l.image(0).unwrap();
        assert_eq!((img.width(), img.height(), img.depth(), img.spectrum()), (1, 2, 2, 1));
        assert_eq!(img.data(), &[1.0, 2.0, 3.0, 0.0]);

        run(&mut l, "input", &[], &[OpArg::Text("(1/2;3;4^5)".into())]).unwrap();
        let img = l.image(1).unwrap();
        assert_eq!((img.width(), img.height(), img.depth(), img.spectrum()), (1, 3, 2, 2));
    }

    #[test]
    fn input_rejects_huge_dimensions() {
        let mut l = ImageList::new();
        for text in ["1e30", "100000,100000,100000", "65536,65536,65536,65536"] {
            let err = run(&mut l, "input", &[], &[OpArg::Text(text.into())]).unwrap_err();
            assert!(matches!(err, OpError::InvalidArgument(_)), "{text}");
        }
        assert!(l.is_empty());
    }

    #[test]
    fn input_file_is_unsupported() {
        let mut l = ImageList::new();
        let err = run(&mut l, "input", &[], &[OpArg::Text("photo.png".into())]).unwrap_err();
        assert!(matches!(err, OpError::Unsupported(_)));
    }

    #[test]
    fn add_number_and_image() {
        let mut l = ImageList::new();
        l.push(Image::scalar(1.0), "a");
        l.push(Image::scalar(10.0), "b");
        run(&mut l, "add", &[0], &[OpArg::Number(2.0)]).unwrap();
        run(&mut l, "add", &[1], &[OpArg::Image(0)]).unwrap();
        assert_eq!(first_values(&l), vec![3.0, 13.0]);
    }

    #[test]
    fn add_without_argument_folds() {
        let mut l = ImageList::new();
        for v in [1.0, 2.0, 3.0] {
            l.push(Image::scalar(v), "x");
        }
        run(&mut l, "add", &[0, 1, 2], &[]).unwrap();
        assert_eq!(first_values(&l), vec![6.0]);
        l.check_consistency().unwrap();
    }

    #[test]
    fn fill_expression_uses_coordinates() {
        let mut l = ImageList::new();
        l.push(Image::new(3, 1, 1, 1), "ramp");
        run(&mut l, "fill", &[0], &[OpArg::Text("x*2+w".into())]).unwrap();
        assert_eq!(l.image(0).unwrap().data(), &[3.0, 5.0, 7.0]);
    }

    #[test]
    fn cut_and_normalize() {
        let mut l = ImageList::new();
        l.push(Image::from_values(3, 1, 1, 1, vec![-5.0, 0.5, 9.0]).unwrap(), "v");
        run(&mut l, "cut", &[0], &[OpArg::Number(0.0), OpArg::Number(1.0)]).unwrap();
        assert_eq!(l.image(0).unwrap().data(), &[0.0, 0.5, 1.0]);
        run(&mut l, "normalize", &[0], &[OpArg::Number(0.0), OpArg::Number(10.0)]).unwrap();
        assert_eq!(l.image(0).unwrap().data(), &[0.0, 5.0, 10.0]);
    }

    #[test]
    fn unknown_operation() {
        let mut l = ImageList::new();
        assert!(matches!(
            run(&mut l, "blur", &[], &[]).unwrap_err(),
            OpError::Unsupported(_)
        ));
    }

    #[test]
    fn expression_sees_image_features() {
        let img = Image::new(640, 480, 1, 3);
        let ctx = ExprContext { image: Some(&img), image_count: 2 };
        let v = BasicLibrary.evaluate_expression("w*h+l", &ctx).unwrap();
        assert_eq!(v, Value::Scalar(307202.0));
    }
}
