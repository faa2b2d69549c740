// Parser for typed SSA listings (.ssa).
//
// Parses a token stream (from the lexer) into a `TypedProgram`. Uses chumsky
// combinators. The listing format is the one produced by `TypedProgram`'s
// `Display` implementation.
//
// Preconditions: input is a valid token stream from `lexer::lex()`.
// Postconditions: returns a program plus any parse errors (non-fatal).
// Failure modes: syntax errors and out-of-order blocks produce `Rich`
//                diagnostics.
// Side effects: none.

use chumsky::input::{Stream, ValueInput};
use chumsky::prelude::*;
use chumsky::span::SimpleSpan;
use indexmap::IndexMap;

use crate::id::BlockId;
use crate::lexer::Token;
use crate::reduce::{GlobalStrategyKind, LocalStrategyKind};
use crate::schedule::ScheduleKind;
use crate::ssa::*;
use crate::types::{Constant, NumericKind, Storage, VarType};

/// Result of parsing: program plus any errors.
#[derive(Debug)]
pub struct ParseResult {
    pub program: Option<TypedProgram>,
    pub errors: Vec<Rich<'static, Token, SimpleSpan>>,
}

/// Parse an SSA listing. Lexes then parses.
pub fn parse(source: &str) -> ParseResult {
    let lex_result = crate::lexer::lex(source);
    let len = source.len();

    let token_iter = lex_result.tokens.into_iter().map(|(tok, span)| {
        let cspan: SimpleSpan = (span.start..span.end).into();
        (tok, cspan)
    });
    let eoi: SimpleSpan = (len..len).into();
    let stream = Stream::from_iter(token_iter).map(eoi, |(t, s): (_, _)| (t, s));

    let parser = program_parser(source);
    let (program, parse_errors) = parser.parse(stream).into_output_errors();

    let mut all_errors: Vec<Rich<'static, Token, SimpleSpan>> = lex_result
        .errors
        .into_iter()
        .map(|e| {
            let span: SimpleSpan = (e.span.start..e.span.end).into();
            Rich::custom(span, e.message)
        })
        .collect();
    all_errors.extend(parse_errors.into_iter().map(|e| e.into_owned()));

    ParseResult {
        program,
        errors: all_errors,
    }
}

// ── Intermediate forms ──

/// Right-hand side of `name = ...`.
#[derive(Clone)]
enum Rhs {
    Arg(usize),
    Builtin(Builtin),
    Call(String, Vec<String>),
    Get(String, Vec<String>),
    Set(String, Vec<String>, String),
    SimpleGet(String, Vec<String>),
    SimpleSet(String, Vec<String>, String),
    GetOrFirst(String, String),
    Iter,
    Phi(Vec<(BlockId, String)>),
    Value(Operand),
}

impl Rhs {
    fn into_instruction(self, output: String) -> Instruction {
        match self {
            Rhs::Arg(index) => Instruction::Argument { output, index },
            Rhs::Builtin(which) => Instruction::Builtin { output, which },
            Rhs::Call(callee, inputs) => Instruction::Call {
                outputs: vec![output],
                callee,
                inputs,
            },
            Rhs::Get(matrix, indices) => Instruction::MatrixGet {
                output,
                matrix,
                indices,
            },
            Rhs::Set(matrix, indices, value) => Instruction::MatrixSet {
                output,
                matrix,
                indices,
                value,
            },
            Rhs::SimpleGet(matrix, indices) => Instruction::SimpleGet {
                output,
                matrix,
                indices,
            },
            Rhs::SimpleSet(matrix, indices, value) => Instruction::SimpleSet {
                output,
                matrix,
                indices,
                value,
            },
            Rhs::GetOrFirst(matrix, index) => Instruction::GetOrFirst {
                output,
                matrix,
                index,
            },
            Rhs::Iter => Instruction::Iter { output },
            Rhs::Phi(sources) => Instruction::Phi { output, sources },
            Rhs::Value(input) => Instruction::Assignment { output, input },
        }
    }
}

/// One option of a `parallel` line.
enum ParallelOption {
    Schedule(Option<ScheduleKind>, Vec<SizeRef>),
    LocalSize(Vec<SizeRef>),
    Strategies(Vec<GlobalStrategyKind>),
    LocalStrategies(Vec<LocalStrategyKind>),
    Reduce(ReductionDecl),
}

// ── Main parser builder ──
//
// All grammar rules are built inside `program_parser` so that the `source`
// reference is captured once and shared by all combinators.

fn program_parser<'tokens, 'src: 'tokens, I>(
    source: &'src str,
) -> impl Parser<'tokens, I, TypedProgram, extra::Err<Rich<'tokens, Token, SimpleSpan>>> + 'src
where
    'tokens: 'src,
    I: ValueInput<'tokens, Token = Token, Span = SimpleSpan>,
{
    // ── Newlines ──

    let nl = just(Token::Newline).repeated().ignored();
    let nl1 = just(Token::Newline).repeated().at_least(1).ignored();

    // ── Names ──

    let name = just(Token::Ident).map_with(move |_, e| {
        let span: SimpleSpan = e.span();
        source[span.start()..span.end()].to_string()
    });

    let names = name
        .clone()
        .separated_by(just(Token::Comma))
        .collect::<Vec<_>>();

    let block_ref = select! { Token::BlockRef(n) => BlockId(n) };

    let int = select! { Token::Int(n) => n };

    let count = int.clone().try_map(|n, span| {
        usize::try_from(n).map_err(|_| {
            Rich::custom(span, format!("expected a non-negative count, found {n}"))
        })
    });

    // ── Types ──

    let kind = name.clone().try_map(|n, span| {
        NumericKind::from_name(&n)
            .ok_or_else(|| Rich::custom(span, format!("unknown numeric kind '{n}'")))
    });

    let constant = select! {
        Token::Int(n) => Constant::Int(n),
        Token::Float(v) => Constant::Float(v),
    };

    let dim = select! {
        Token::Int(n) if n >= 0 => Some(n as u64),
        Token::Question => None,
    };

    let storage = name.clone().try_map(|n, span| match n.as_str() {
        "static" => Ok(Storage::Static),
        "buffer" => Ok(Storage::Buffer),
        "sized" => Ok(Storage::Sized),
        _ => Err(Rich::custom(
            span,
            format!("expected storage class (static, buffer, sized), found '{n}'"),
        )),
    });

    let shape = dim
        .separated_by(just(Token::Comma))
        .at_least(1)
        .collect::<Vec<_>>()
        .delimited_by(just(Token::LBracket), just(Token::RBracket))
        .then(storage.or_not());

    let var_type = kind
        .then(constant.delimited_by(just(Token::LParen), just(Token::RParen)).or_not())
        .then(shape.or_not())
        .try_map(|((kind, constant), shape), span| match (constant, shape) {
            (_, None) => Ok(VarType::Scalar(crate::types::ScalarType { kind, constant })),
            (None, Some((dims, storage))) => Ok(VarType::matrix(
                kind,
                dims,
                storage.unwrap_or(Storage::Dynamic),
            )),
            (Some(_), Some(_)) => Err(Rich::custom(span, "matrix types cannot carry a constant")),
        });

    let type_entry = name
        .clone()
        .then_ignore(just(Token::Colon))
        .then(var_type);

    let types_section = just(Token::Types)
        .ignore_then(just(Token::LBrace))
        .ignore_then(nl.clone())
        .ignore_then(
            type_entry
                .separated_by(nl1.clone())
                .allow_trailing()
                .collect::<Vec<_>>(),
        )
        .then_ignore(nl.clone())
        .then_ignore(just(Token::RBrace));

    // ── Parallel annotations ──

    let size_ref = select! { Token::Int(n) if n >= 0 => SizeRef::Const(n as u64) }
        .or(name.clone().map(SizeRef::Var));

    let size_list = size_ref
        .clone()
        .separated_by(just(Token::Comma))
        .at_least(1)
        .collect::<Vec<_>>();

    let schedule_name = name.clone().try_map(|n, span| {
        if n == "auto" {
            return Ok(None);
        }
        ScheduleKind::from_name(&n)
            .map(Some)
            .ok_or_else(|| Rich::custom(span, format!("unknown schedule '{n}'")))
    });

    let schedule_opt = just(Token::Schedule)
        .ignore_then(
            schedule_name
                .then(
                    just(Token::Comma)
                        .ignore_then(size_ref.clone())
                        .repeated()
                        .collect::<Vec<_>>(),
                )
                .delimited_by(just(Token::LParen), just(Token::RParen)),
        )
        .map(|(kind, params)| ParallelOption::Schedule(kind, params));

    let local_size_opt = just(Token::LocalSize)
        .ignore_then(size_list.delimited_by(just(Token::LParen), just(Token::RParen)))
        .map(ParallelOption::LocalSize);

    let global_strategy = name.clone().try_map(|n, span| {
        GlobalStrategyKind::from_name(&n)
            .ok_or_else(|| Rich::custom(span, format!("unknown reduction strategy '{n}'")))
    });

    let strategies_opt = just(Token::Strategies)
        .ignore_then(
            global_strategy
                .separated_by(just(Token::Comma))
                .at_least(1)
                .collect::<Vec<_>>()
                .delimited_by(just(Token::LParen), just(Token::RParen)),
        )
        .map(ParallelOption::Strategies);

    let local_strategy = name.clone().try_map(|n, span| {
        LocalStrategyKind::from_name(&n)
            .ok_or_else(|| Rich::custom(span, format!("unknown local reduction strategy '{n}'")))
    });

    let local_strategies_opt = just(Token::LocalStrategies)
        .ignore_then(
            local_strategy
                .separated_by(just(Token::Comma))
                .at_least(1)
                .collect::<Vec<_>>()
                .delimited_by(just(Token::LParen), just(Token::RParen)),
        )
        .map(ParallelOption::LocalStrategies);

    let reduction_kind = name.clone().try_map(|n, span| {
        ReductionKind::from_name(&n)
            .ok_or_else(|| Rich::custom(span, format!("unknown reduction kind '{n}'")))
    });

    let reduce_opt = just(Token::Reduce)
        .ignore_then(reduction_kind)
        .then(
            name.clone()
                .then_ignore(just(Token::Arrow))
                .then(name.clone())
                .delimited_by(just(Token::LParen), just(Token::RParen)),
        )
        .map(|(kind, (initial, final_name))| {
            ParallelOption::Reduce(ReductionDecl {
                kind,
                initial,
                final_name,
            })
        });

    let parallel_line = just(Token::Parallel)
        .ignore_then(
            block_ref
                .clone()
                .separated_by(just(Token::Comma))
                .at_least(1)
                .collect::<Vec<_>>(),
        )
        .then(
            choice((
                schedule_opt,
                local_size_opt,
                strategies_opt,
                local_strategies_opt,
                reduce_opt,
            ))
            .repeated()
            .collect::<Vec<_>>(),
        )
        .map(|(loops, options)| {
            let mut descriptor = ParallelLoopDescriptor {
                loops,
                reductions: Vec::new(),
                settings: ParallelRegionSettings::default(),
            };
            for option in options {
                match option {
                    ParallelOption::Schedule(kind, params) => {
                        descriptor.settings.schedule = kind;
                        descriptor.settings.schedule_params = params;
                    }
                    ParallelOption::LocalSize(sizes) => descriptor.settings.local_sizes = sizes,
                    ParallelOption::Strategies(s) => descriptor.settings.reduction_strategies = s,
                    ParallelOption::LocalStrategies(s) => {
                        descriptor.settings.local_reduction_strategies = s
                    }
                    ParallelOption::Reduce(r) => descriptor.reductions.push(r),
                }
            }
            descriptor
        });

    // ── Instructions ──

    let indexed = name.clone().then(
        names
            .clone()
            .delimited_by(just(Token::LBracket), just(Token::RBracket)),
    );

    let call_args = names
        .clone()
        .delimited_by(just(Token::LParen), just(Token::RParen));

    let builtin = name.clone().try_map(|n, span| match n.as_str() {
        "pi" => Ok(Builtin::Pi),
        "true" => Ok(Builtin::True),
        "false" => Ok(Builtin::False),
        "nargin" => Ok(Builtin::Nargin),
        _ => Err(Rich::custom(span, format!("unknown builtin '{n}'"))),
    });

    let phi_source = block_ref.clone().then_ignore(just(Token::Colon)).then(name.clone());

    let operand = select! {
        Token::Int(n) => Operand::Int(n),
        Token::Float(v) => Operand::Float(v),
    }
    .or(name.clone().map(Operand::Var));

    let rhs = choice((
        just(Token::Arg).ignore_then(count).map(Rhs::Arg),
        just(Token::Builtin).ignore_then(builtin).map(Rhs::Builtin),
        just(Token::Call)
            .ignore_then(name.clone())
            .then(call_args.clone())
            .map(|(callee, args)| Rhs::Call(callee, args)),
        just(Token::Get)
            .ignore_then(indexed.clone())
            .map(|(m, idx)| Rhs::Get(m, idx)),
        just(Token::Set)
            .ignore_then(indexed.clone())
            .then_ignore(just(Token::Equals))
            .then(name.clone())
            .map(|((m, idx), v)| Rhs::Set(m, idx, v)),
        just(Token::SimpleGet)
            .ignore_then(indexed.clone())
            .map(|(m, idx)| Rhs::SimpleGet(m, idx)),
        just(Token::SimpleSet)
            .ignore_then(indexed.clone())
            .then_ignore(just(Token::Equals))
            .then(name.clone())
            .map(|((m, idx), v)| Rhs::SimpleSet(m, idx, v)),
        just(Token::GetOrFirst)
            .ignore_then(
                name.clone().then(
                    name.clone()
                        .delimited_by(just(Token::LBracket), just(Token::RBracket)),
                ),
            )
            .map(|(m, i)| Rhs::GetOrFirst(m, i)),
        just(Token::Iter).to(Rhs::Iter),
        just(Token::Phi)
            .ignore_then(
                phi_source
                    .separated_by(just(Token::Comma))
                    .at_least(1)
                    .collect::<Vec<_>>(),
            )
            .map(Rhs::Phi),
        operand.map(Rhs::Value),
    ));

    let assign_instr = name
        .clone()
        .then_ignore(just(Token::Equals))
        .then(rhs)
        .map(|(output, rhs)| rhs.into_instruction(output));

    let multi_call = names
        .clone()
        .delimited_by(just(Token::LBracket), just(Token::RBracket))
        .then_ignore(just(Token::Equals))
        .then_ignore(just(Token::Call))
        .then(name.clone())
        .then(call_args.clone())
        .map(|((outputs, callee), inputs)| Instruction::Call {
            outputs,
            callee,
            inputs,
        });

    let bare_call = just(Token::Call)
        .ignore_then(name.clone())
        .then(call_args)
        .map(|(callee, inputs)| Instruction::Call {
            outputs: Vec::new(),
            callee,
            inputs,
        });

    let comment = just(Token::Comment)
        .ignore_then(select! { Token::StringLit(s) => s })
        .map(Instruction::Comment);

    let line = just(Token::Line).ignore_then(int).try_map(|n, span| {
        u32::try_from(n)
            .map(Instruction::Line)
            .map_err(|_| Rich::custom(span, format!("invalid line number {n}")))
    });

    let branch = just(Token::Branch)
        .ignore_then(name.clone())
        .then_ignore(just(Token::Then))
        .then(block_ref.clone())
        .then_ignore(just(Token::Else))
        .then(block_ref.clone())
        .then_ignore(just(Token::End))
        .then(block_ref.clone())
        .map(
            |(((condition, true_block), false_block), end_block)| Instruction::Branch {
                condition,
                true_block,
                false_block,
                end_block,
            },
        );

    let for_instr = just(Token::For)
        .ignore_then(name.clone())
        .then_ignore(just(Token::Comma))
        .then(name.clone())
        .then_ignore(just(Token::Comma))
        .then(name.clone())
        .then_ignore(just(Token::Loop))
        .then(block_ref.clone())
        .then_ignore(just(Token::End))
        .then(block_ref.clone())
        .map(
            |((((start, interval), end), loop_block), end_block)| Instruction::For {
                start,
                interval,
                end,
                loop_block,
                end_block,
            },
        );

    let while_instr = just(Token::While)
        .ignore_then(just(Token::Loop))
        .ignore_then(block_ref.clone())
        .then_ignore(just(Token::End))
        .then(block_ref.clone())
        .map(|(loop_block, end_block)| Instruction::While {
            loop_block,
            end_block,
        });

    let pcopy = just(Token::Pcopy)
        .ignore_then(names.clone())
        .then_ignore(just(Token::LeftArrow))
        .then(names.clone())
        .try_map(|(dsts, srcs), span| {
            if dsts.len() != srcs.len() {
                return Err(Rich::custom(
                    span,
                    format!(
                        "pcopy has {} destinations but {} sources",
                        dsts.len(),
                        srcs.len()
                    ),
                ));
            }
            Ok(Instruction::ParallelCopy {
                copies: dsts.into_iter().zip(srcs).collect(),
            })
        });

    let init = just(Token::Init)
        .ignore_then(name.clone())
        .map(|name| Instruction::Initialization { name });

    let instruction = choice((
        assign_instr,
        multi_call,
        bare_call,
        comment,
        line,
        branch,
        for_instr,
        while_instr,
        pcopy,
        just(Token::Break).to(Instruction::Break),
        init,
    ));

    let block_section = just(Token::Block)
        .ignore_then(block_ref)
        .then_ignore(just(Token::LBrace))
        .then_ignore(nl.clone())
        .then(
            instruction
                .separated_by(nl1.clone())
                .allow_trailing()
                .collect::<Vec<_>>(),
        )
        .then_ignore(nl.clone())
        .then_ignore(just(Token::RBrace))
        .map_with(|(id, instructions), e| (id, instructions, e.span()));

    // ── Functions ──

    let function = just(Token::Function)
        .ignore_then(name.clone())
        .then(
            names
                .clone()
                .delimited_by(just(Token::LParen), just(Token::RParen)),
        )
        .then_ignore(just(Token::Arrow))
        .then(names.delimited_by(just(Token::LParen), just(Token::RParen)))
        .then_ignore(nl1.clone())
        .then(types_section.then_ignore(nl1.clone()).or_not())
        .then(
            parallel_line
                .then_ignore(nl1.clone())
                .repeated()
                .collect::<Vec<_>>(),
        )
        .then(
            block_section
                .then_ignore(nl1.clone())
                .repeated()
                .collect::<Vec<_>>(),
        )
        .then_ignore(just(Token::End))
        .try_map(
            |(((((name, params), outputs), types), parallel), blocks), _span| {
                let mut body = FunctionBody::default();
                for (position, (id, instructions, span)) in blocks.into_iter().enumerate() {
                    if id.index() != position {
                        return Err(Rich::custom(
                            span,
                            format!("expected block #{position}, found {id}"),
                        ));
                    }
                    body.blocks.push(Block::new(instructions));
                }
                let types: IndexMap<String, VarType> =
                    types.unwrap_or_default().into_iter().collect();
                Ok(TypedFunction {
                    name,
                    params,
                    outputs,
                    types,
                    parallel,
                    body,
                })
            },
        );

    // ── Program ──

    nl.clone()
        .ignore_then(
            function
                .separated_by(nl1)
                .allow_trailing()
                .collect::<Vec<_>>(),
        )
        .then_ignore(nl)
        .map(|functions| TypedProgram { functions })
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(source: &str) -> TypedProgram {
        let result = parse(source);
        assert!(
            result.errors.is_empty(),
            "unexpected parse errors: {:?}",
            result.errors
        );
        result.program.expect("program should be present")
    }

    const SCALE: &str = "\
function scale(A$1, n$1) -> (B$3)
  types {
    A$1: double[?]
    n$1: int32
    B$1: double[?] buffer
    B$2: double[?] buffer
    B$3: double[?] buffer
    B$4: double[?] buffer
    $one: int32(1)
    i$1: int32
    $t: double
  }
  parallel #0 schedule(direct) local_size(64)
  block #0 {
    A$1 = arg 0
    n$1 = arg 1
    $one = 1
    for $one, $one, n$1 loop #1 end #2
  }
  block #1 {
    B$2 = phi #0:B$1, #1:B$4
    i$1 = iter
    $t = simple_get A$1[i$1]
    B$4 = simple_set B$2[i$1] = $t
  }
  block #2 {
    B$3 = phi #0:B$1, #1:B$4
  }
end
";

    #[test]
    fn parses_function_header_and_types() {
        let program = parse_ok(SCALE);
        assert_eq!(program.functions.len(), 1);
        let f = &program.functions[0];
        assert_eq!(f.name, "scale");
        assert_eq!(f.params, vec!["A$1", "n$1"]);
        assert_eq!(f.outputs, vec!["B$3"]);
        assert_eq!(f.types.len(), 9);
        assert_eq!(f.types["$one"].constant_value(), Some(Constant::Int(1)));
        assert_eq!(f.body.blocks.len(), 3);
    }

    #[test]
    fn parses_parallel_annotation() {
        let program = parse_ok(SCALE);
        let d = &program.functions[0].parallel[0];
        assert_eq!(d.loops, vec![BlockId(0)]);
        assert_eq!(d.settings.schedule, Some(ScheduleKind::Direct));
        assert_eq!(d.settings.local_sizes, vec![SizeRef::Const(64)]);
    }

    #[test]
    fn parses_instructions() {
        let program = parse_ok(SCALE);
        let b1 = &program.functions[0].body.blocks[1];
        assert_eq!(b1.instructions[1], Instruction::Iter { output: "i$1".into() });
        assert!(matches!(
            &b1.instructions[3],
            Instruction::SimpleSet { matrix, value, .. } if matrix == "B$2" && value == "$t"
        ));
    }

    #[test]
    fn display_roundtrips() {
        let program = parse_ok(SCALE);
        let printed = program.to_string();
        let reparsed = parse_ok(&printed);
        assert_eq!(program, reparsed);
    }

    #[test]
    fn parses_calls_and_control() {
        let source = "\
function f(x$1) -> (y$1)
  block #0 {
    [a$1, b$1] = call split(x$1)
    call print(a$1)
    c$1 = call lt(a$1, b$1)
    line 7
    comment \"note\"
    branch c$1 then #1 else #2 end #3
  }
  block #1 {
    pcopy p, q <- q, p
  }
  block #2 {
  }
  block #3 {
    y$1 = phi #1:a$1, #2:b$1
    w$1 = builtin pi
    init w$1
  }
end
";
        let program = parse_ok(source);
        let b0 = &program.functions[0].body.blocks[0];
        assert!(matches!(
            &b0.instructions[0],
            Instruction::Call { outputs, .. } if outputs.len() == 2
        ));
        assert!(matches!(
            &b0.instructions[1],
            Instruction::Call { outputs, .. } if outputs.is_empty()
        ));
        assert_eq!(b0.instructions[3], Instruction::Line(7));
        let b1 = &program.functions[0].body.blocks[1];
        assert_eq!(
            b1.instructions[0],
            Instruction::ParallelCopy {
                copies: vec![("p".into(), "q".into()), ("q".into(), "p".into())]
            }
        );
        assert!(program.functions[0].body.blocks[2].instructions.is_empty());
    }

    #[test]
    fn parses_reductions_and_schedule_params() {
        let source = "\
function g() -> ()
  parallel #0, #2 schedule(coarse_sequential, 4) strategies(local_memory) reduce sum(s$0 -> s$9)
  block #0 {
  }
end
";
        let program = parse_ok(source);
        let d = &program.functions[0].parallel[0];
        assert_eq!(d.loops, vec![BlockId(0), BlockId(2)]);
        assert_eq!(d.settings.schedule, Some(ScheduleKind::CoarseSequential));
        assert_eq!(d.settings.schedule_params, vec![SizeRef::Const(4)]);
        assert_eq!(
            d.settings.reduction_strategies,
            vec![GlobalStrategyKind::LocalMemory]
        );
        assert_eq!(d.reductions[0].kind, ReductionKind::Sum);
        assert_eq!(d.reductions[0].final_name, "s$9");
    }

    #[test]
    fn out_of_order_blocks_rejected() {
        let source = "\
function g() -> ()
  block #1 {
  }
end
";
        let result = parse(source);
        assert!(!result.errors.is_empty());
    }

    #[test]
    fn unknown_type_rejected() {
        let source = "\
function g() -> ()
  types {
    x: quaternion
  }
end
";
        let result = parse(source);
        assert!(!result.errors.is_empty());
    }
}
